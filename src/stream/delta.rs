use super::normalize::NormalizedRecord;

/// Content increment carried by a record, if any.
///
/// The final `done` frame never yields a delta, even when it repeats content.
pub fn extract_delta(record: &NormalizedRecord) -> Option<&str> {
    if record.done {
        return None;
    }
    record.content.as_deref().filter(|content| !content.is_empty())
}
