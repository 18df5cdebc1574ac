/// Splits chapter text into request-sized chunks at paragraph boundaries.
///
/// `max_chars == 0` keeps the whole chapter as one chunk. Sizes are counted in characters,
/// not bytes. A paragraph longer than `max_chars` is never cut; it becomes its own chunk.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        let whole = text.trim();
        if whole.is_empty() {
            return Vec::new();
        }
        return vec![whole.to_owned()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for paragraph in text.split('\n') {
        let paragraph = paragraph.trim_end_matches('\r');
        if paragraph.trim().is_empty() {
            continue;
        }
        let paragraph_chars = paragraph.chars().count();

        let joined_chars = if current.is_empty() {
            paragraph_chars
        } else {
            current_chars + 1 + paragraph_chars
        };
        if !current.is_empty() && joined_chars > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        if !current.is_empty() {
            current.push('\n');
            current_chars += 1;
        }
        current.push_str(paragraph);
        current_chars += paragraph_chars;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}
