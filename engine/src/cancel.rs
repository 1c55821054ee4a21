//! Cooperative cancellation scopes.

use std::sync::Arc;

use futures::{stream, StreamExt};
use parking_lot::Mutex;
use relay_core::TaskError;
use tokio_util::sync::CancellationToken;

use crate::{registry::Cancelable, services::ByteStream};

/// Cancel error of one scope, linked to the scope it was derived from.
#[derive(Debug, Default)]
struct Reason {
	error: Mutex<Option<TaskError>>,
	parent: Option<Arc<Reason>>,
}

/// A cancellation token plus the error that observers receive once it fires.
///
/// Child scopes are canceled with their ancestors and report the nearest
/// ancestor's error unless they were given their own.
#[derive(Clone, Debug, Default)]
pub struct CancelScope {
	token: CancellationToken,
	reason: Arc<Reason>,
}

impl CancelScope {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn child(&self) -> Self {
		Self {
			token: self.token.child_token(),
			reason: Arc::new(Reason {
				error: Mutex::new(None),
				parent: Some(self.reason.clone()),
			}),
		}
	}

	/// Cancel with `error`. The first error wins.
	pub fn cancel(&self, error: TaskError) {
		{
			let mut reason = self.reason.error.lock();
			if reason.is_none() {
				*reason = Some(error);
			}
		}
		self.token.cancel();
	}

	pub fn is_canceled(&self) -> bool {
		self.token.is_cancelled()
	}

	pub fn error(&self) -> TaskError {
		let mut reason = Some(&self.reason);
		while let Some(current) = reason {
			if let Some(err) = current.error.lock().clone() {
				return err;
			}
			reason = current.parent.as_ref();
		}
		TaskError::canceled("canceled")
	}

	/// `Err` with the cancel error once canceled.
	pub fn check(&self) -> Result<(), TaskError> {
		if self.is_canceled() {
			Err(self.error())
		} else {
			Ok(())
		}
	}

	pub async fn cancelled(&self) {
		self.token.cancelled().await
	}
}

impl Cancelable for CancelScope {
	fn cancel(&self, reason: &TaskError) -> Result<(), TaskError> {
		CancelScope::cancel(self, reason.clone());
		Ok(())
	}
}

/// Wrap a byte stream so a pending read fails with the scope's error as soon
/// as the scope is canceled. The stream ends after yielding that error.
pub fn guard_stream(stream: ByteStream, scope: CancelScope) -> ByteStream {
	stream::unfold(Some((stream, scope)), |state| async move {
		let (mut stream, scope) = match state {
			Some(state) => state,
			None => return None,
		};
		tokio::select! {
			biased;
			_ = scope.cancelled() => {
				let err = scope.error();
				Some((Err(err), None))
			}
			next = stream.next() => match next {
				Some(Ok(chunk)) => Some((Ok(chunk), Some((stream, scope)))),
				Some(Err(err)) => Some((Err(err), None)),
				None => None,
			},
		}
	})
	.boxed()
}
