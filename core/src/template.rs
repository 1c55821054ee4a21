use std::collections::BTreeMap;

/// Substitute `${Name}` placeholders. Names without an entry stay as written
/// so a typo in the template is visible in the resulting key.
pub fn render_key_template(template: &str, vars: &BTreeMap<String, String>) -> String {
	let mut out = String::with_capacity(template.len());
	let mut rest = template;

	while let Some(start) = rest.find("${") {
		out.push_str(&rest[..start]);
		let after = &rest[start + 2..];
		match after.find('}') {
			Some(end) => {
				let name = &after[..end];
				match vars.get(name) {
					Some(value) => out.push_str(value),
					None => out.push_str(&rest[start..start + 2 + end + 1]),
				}
				rest = &after[end + 1..];
			}
			None => {
				out.push_str(&rest[start..]);
				rest = "";
			}
		}
	}
	out.push_str(rest);
	out
}
