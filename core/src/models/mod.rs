mod locator;
mod meta;
mod state;
mod task_result;
mod work_item;

pub use locator::{is_signed_url, redact_text, redact_url, Locator, ObjectRef};
pub use meta::{ObjectMeta, CRC64_HEADER, PIPELINE_MARKER_HEADER, PIPELINE_MARKER_KEY, USER_META_PREFIX};
pub use state::OrchestratorState;
pub use task_result::{TaskOutcome, TaskParams, TaskResult};
pub use work_item::WorkItem;
