//! Object key helpers

/// Replace anything outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Deterministic key for the `index`-th media file of a post
pub fn post_media_path(prefix: &str, client_id: &str, post_id: &str, index: usize, name: &str) -> String {
    format!(
        "{}/{}/{}/{:02}_{}",
        prefix.trim_end_matches('/'),
        sanitize_file_name(client_id),
        sanitize_file_name(post_id),
        index + 1,
        sanitize_file_name(name)
    )
}

/// Key of an individually uploaded part object
pub fn part_object_name(name: &str, part_number: u32) -> String {
    format!("{name}.part{part_number}")
}
