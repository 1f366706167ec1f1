#[derive(Debug, Clone)]
pub struct FormatterConfig {
    pub indent_spaces: usize,
    /// Blank line between top-level definitions.
    pub block_spacing: bool,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            indent_spaces: 4,
            block_spacing: true,
        }
    }
}
