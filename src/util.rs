/// Renders raw protocol bytes for logging, escaping anything that isn't
/// printable ASCII.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}
