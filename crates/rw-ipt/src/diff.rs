use rw_core::Family;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};

/// Dry-run result for one family: the live ruleset as the engine sees it and
/// the payload a cycle would commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FamilyPlan {
    pub family: Family,
    pub changed: bool,
    pub current: String,
    pub desired: String,
}

impl FamilyPlan {
    pub fn diff(&self) -> String {
        render_diff(&self.current, &self.desired)
    }
}

/// Line diff in `+`/`-`/` ` notation.
pub fn render_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut output = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        output.push(sign);
        output.push_str(change.value());
        if change.missing_newline() {
            output.push('\n');
        }
    }

    output
}
