//! Diagram markup framing.
//!
//! The engine only emits output for a unit once it sees an `@end…` line, so
//! every unit sent to it must carry one.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConvertError;

/// End-of-diagram marker appended to markup that lacks one.
///
/// The engine closes a unit on any line starting with `@end`, so the bare form
/// also terminates `@startmindmap`, `@startgantt` and friends.
pub const END_MARKER: &str = "@end";

static END_MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*@end[^\n]*$").unwrap());

/// Whether `markup` contains an explicit end-of-diagram line.
#[must_use]
pub fn has_end_marker(markup: &str) -> bool {
    END_MARKER_PATTERN.is_match(markup)
}

/// Return `markup` terminated by an end marker, appending one if missing.
///
/// The result always ends with a newline when a marker had to be appended.
#[must_use]
pub fn ensure_end_marker(markup: &str) -> Cow<'_, str> {
    if has_end_marker(markup) {
        return Cow::Borrowed(markup);
    }
    let separator = if markup.is_empty() || markup.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    Cow::Owned(format!("{markup}{separator}{END_MARKER}\n"))
}

/// Units ending at each end marker, plus the text after the last one.
fn units(markup: &str) -> (Vec<&str>, &str) {
    let mut sections = Vec::new();
    let mut start = 0;
    for m in END_MARKER_PATTERN.find_iter(markup) {
        sections.push(markup[start..m.end()].trim_start_matches(['\r', '\n']));
        start = m.end();
    }
    (sections, &markup[start..])
}

/// Split a multi-diagram source into units, each ending at its `@end…` line.
///
/// Text after the last end marker is dropped. A source without any end
/// marker is returned as a single unit.
#[must_use]
pub fn split_sections(markup: &str) -> Vec<&str> {
    let (mut sections, _) = units(markup);
    if sections.is_empty() {
        sections.push(markup);
    }
    sections
}

/// Frame `markup` as exactly one engine unit.
///
/// The engine answers every `@end…` line with its own image, and text after
/// the last one would open a unit that stays in the engine. Both would leave
/// output on the pipe for the next conversion, so such markup is rejected;
/// use [`split_sections`] to convert the diagrams one by one. Blank text
/// after the end marker is dropped. Markup without an end marker gets one.
///
/// # Errors
///
/// Returns [`ConvertError::MultipleUnits`] for more than one diagram.
pub fn single_unit(markup: &str) -> Result<Cow<'_, str>, ConvertError> {
    let (sections, rest) = units(markup);
    let units = sections.len() + usize::from(!rest.trim().is_empty());
    match sections.as_slice() {
        [] => Ok(ensure_end_marker(markup)),
        [unit] if units == 1 => Ok(Cow::Borrowed(*unit)),
        _ => Err(ConvertError::MultipleUnits { units }),
    }
}
