use std::ops::Range;

use crate::command::CommandTag;

/// A command marker located inside a reply.
///
/// `start..end` covers the whole marker (`TAG:` through the end of the
/// payload) and is what gets replaced; `payload_start..end` is the candidate
/// JSON text handed to the repair engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMarker {
    pub tag: CommandTag,
    pub start: usize,
    pub payload_start: usize,
    pub end: usize,
}

impl CommandMarker {
    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn payload<'a>(&self, reply: &'a str) -> &'a str {
        &reply[self.payload_start..self.end]
    }
}

/// Locates command markers and delimits their JSON payloads.
pub struct CommandScanner;

impl CommandScanner {
    /// First `TAG:` followed by optional whitespace and `{`.
    pub fn find(reply: &str, tag: CommandTag) -> Option<CommandMarker> {
        Self::find_from(reply, tag, 0)
    }

    /// Same as [`CommandScanner::find`] but ignores everything before `offset`.
    pub fn find_from(reply: &str, tag: CommandTag, offset: usize) -> Option<CommandMarker> {
        if offset > reply.len() || !reply.is_char_boundary(offset) {
            return None;
        }

        let needle = format!("{}:", tag.marker());
        let mut search = offset;

        while let Some(pos) = reply[search..].find(&needle) {
            let start = search + pos;
            let after = start + needle.len();
            let rest = &reply[after..];
            let trimmed = rest.trim_start();

            if trimmed.starts_with('{') {
                let payload_start = after + (rest.len() - trimmed.len());
                return Some(CommandMarker {
                    tag,
                    start,
                    payload_start,
                    end: payload_end(reply, payload_start),
                });
            }

            // Tag without a payload; keep looking further on
            search = after;
        }

        None
    }

    /// Earliest marker of any kind at or after `offset`.
    pub fn next_marker(reply: &str, offset: usize) -> Option<CommandMarker> {
        CommandTag::ALL
            .into_iter()
            .filter_map(|tag| Self::find_from(reply, tag, offset))
            .min_by_key(|marker| marker.start)
    }
}

/// End (exclusive) of the object opened at `open`.
///
/// Tracks brace depth outside of string literals and stops at the closing
/// brace. Double-quoted strings honour escapes. A single quote opens a string
/// only where a key or value starts and closes only before `,`, `:`, `}`, `]`
/// or the end, so apostrophes inside values stay part of the value. A payload
/// that never closes is a truncated reply: the span then runs to the last `}`
/// in the remaining text, or to the end when there is none.
fn payload_end(reply: &str, open: usize) -> usize {
    let bytes = reply.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    let mut prev = b'{';

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match quote {
            Some(b'"') => {
                match b {
                    _ if escaped => escaped = false,
                    b'\\' => escaped = true,
                    b'"' => quote = None,
                    _ => {}
                }
                continue;
            }
            Some(_) => {
                if b == b'\'' && closes_single_quote(&bytes[i + 1..]) {
                    quote = None;
                    prev = b;
                }
                continue;
            }
            None => {}
        }

        match b {
            b'"' => quote = Some(b),
            b'\'' if matches!(prev, b'{' | b'[' | b',' | b':') => quote = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        if !b.is_ascii_whitespace() {
            prev = b;
        }
    }

    match reply[open..].rfind('}') {
        Some(idx) => open + idx + 1,
        None => reply.len(),
    }
}

fn closes_single_quote(rest: &[u8]) -> bool {
    match rest.iter().find(|b| !b.is_ascii_whitespace()) {
        None => true,
        Some(&next) => matches!(next, b',' | b':' | b'}' | b']'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_tag() {
        assert_eq!(CommandScanner::find("Sure, here's a tip.", CommandTag::GoalModify), None);
    }

    #[test]
    fn test_tag_without_payload_is_skipped() {
        let reply = "GOAL_DELETE: none yet. GOAL_DELETE: {\"goal_id\": \"g1\"}";
        let marker = CommandScanner::find(reply, CommandTag::GoalDelete).unwrap();
        assert_eq!(marker.payload(reply), "{\"goal_id\": \"g1\"}");
        assert_eq!(&reply[marker.span()], "GOAL_DELETE: {\"goal_id\": \"g1\"}");
    }

    #[test]
    fn test_nested_objects_are_not_cut_at_first_brace() {
        let reply = "Try this!\nMEAL_SUGGESTION: {\"meal_type\": \"dinner\", \"remaining_macros\": {\"calories\": 600}} Enjoy.";
        let marker = CommandScanner::find(reply, CommandTag::MealSuggestion).unwrap();
        assert_eq!(
            marker.payload(reply),
            "{\"meal_type\": \"dinner\", \"remaining_macros\": {\"calories\": 600}}"
        );
        assert_eq!(&reply[marker.end..], " Enjoy.");
    }

    #[test]
    fn test_whitespace_and_newlines_before_payload() {
        let reply = "FOOD_LOG:\n  {\"name\": \"apple\"}";
        let marker = CommandScanner::find(reply, CommandTag::FoodLog).unwrap();
        assert_eq!(marker.start, 0);
        assert_eq!(marker.payload(reply), "{\"name\": \"apple\"}");
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let reply = "FOOD_INDEX: {\"name\": \"odd } name\"} done";
        let marker = CommandScanner::find(reply, CommandTag::FoodIndex).unwrap();
        assert_eq!(marker.payload(reply), "{\"name\": \"odd } name\"}");
    }

    #[test]
    fn test_truncated_payload_runs_to_last_brace() {
        let reply = "MEAL_SUGGESTION: {\"a\": 1, \"m\": {\"fat\": 20}";
        let marker = CommandScanner::find(reply, CommandTag::MealSuggestion).unwrap();
        assert_eq!(marker.end, reply.len());
        assert_eq!(marker.payload(reply), "{\"a\": 1, \"m\": {\"fat\": 20}");
    }

    #[test]
    fn test_truncated_payload_without_close_runs_to_end() {
        let reply = "GOAL_MODIFY: {\"goal_id\": \"abc";
        let marker = CommandScanner::find(reply, CommandTag::GoalModify).unwrap();
        assert_eq!(marker.end, reply.len());
    }

    #[test]
    fn test_next_marker_picks_earliest() {
        let reply = "FOOD_LOG: {\"name\": \"egg\"} then GOAL_DELETE: {\"goal_id\": \"x\"}";
        let first = CommandScanner::next_marker(reply, 0).unwrap();
        assert_eq!(first.tag, CommandTag::FoodLog);
        let second = CommandScanner::next_marker(reply, first.end).unwrap();
        assert_eq!(second.tag, CommandTag::GoalDelete);
        assert_eq!(CommandScanner::next_marker(reply, second.end), None);
    }

    #[test]
    fn test_offset_past_end() {
        assert_eq!(CommandScanner::find_from("abc", CommandTag::FoodLog, 10), None);
    }

    #[test]
    fn test_offset_inside_multibyte_char() {
        let reply = "café FOOD_LOG: {\"name\": \"egg\"}";
        assert_eq!(CommandScanner::find_from(reply, CommandTag::FoodLog, 4), None);
        assert!(CommandScanner::find_from(reply, CommandTag::FoodLog, 5).is_some());
    }

    #[test]
    fn test_braces_inside_single_quoted_values() {
        let reply = "FOOD_INDEX: {'name': 'a}b'} done";
        let marker = CommandScanner::find(reply, CommandTag::FoodIndex).unwrap();
        assert_eq!(marker.payload(reply), "{'name': 'a}b'}");
        assert_eq!(&reply[marker.end..], " done");
    }

    #[test]
    fn test_apostrophe_inside_single_quoted_value() {
        let reply = "FOOD_LOG: {'name': 'Mom's {best} Chili', 'amount': 1} Enjoy!";
        let marker = CommandScanner::find(reply, CommandTag::FoodLog).unwrap();
        assert_eq!(marker.payload(reply), "{'name': 'Mom's {best} Chili', 'amount': 1}");
    }
}
