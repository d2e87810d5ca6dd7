use crate::error::ReassemblyError;

pub const DEFAULT_CHUNK_PREFIX: &str = "chunks";

/// Deterministic placement of chunk objects inside the object store.
///
/// Chunk `i` of session `s` lives at `<prefix>/<s>/chunk_<i:06>`, so a lexical
/// listing of a session's directory is also its index order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    prefix: String,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_PREFIX)
    }
}

impl ChunkLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn chunk_key(&self, session_id: &str, index: u32) -> String {
        if self.prefix.is_empty() {
            format!("{}/chunk_{:06}", session_id, index)
        } else {
            format!("{}/{}/chunk_{:06}", self.prefix, session_id, index)
        }
    }

    /// Chunk keys of a session in index order, built one at a time.
    pub fn chunk_keys(
        &self,
        session_id: &str,
        total_chunks: u32,
    ) -> impl Iterator<Item = String> + Send + 'static {
        let layout = self.clone();
        let session_id = session_id.to_string();
        (0..total_chunks).map(move |i| layout.chunk_key(&session_id, i))
    }

    /// Session ids end up as a path segment, so they must be a single plain one.
    pub fn validate_session_id(session_id: &str) -> Result<(), ReassemblyError> {
        if session_id.is_empty() {
            return Err(ReassemblyError::InvalidRequest(
                "session id must not be empty".into(),
            ));
        }
        if session_id.contains('/') || session_id.contains('\\') || session_id.contains("..") {
            return Err(ReassemblyError::InvalidRequest(format!(
                "session id {:?} is not a single path segment",
                session_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_zero_padded() {
        let layout = ChunkLayout::default();
        assert_eq!(layout.chunk_key("abc", 0), "chunks/abc/chunk_000000");
        assert_eq!(layout.chunk_key("abc", 42), "chunks/abc/chunk_000042");
    }

    #[test]
    fn keys_sort_in_index_order() {
        let layout = ChunkLayout::default();
        let mut keys: Vec<String> = layout.chunk_keys("s", 120).collect();
        let expected = keys.clone();
        keys.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn keys_are_lazy() {
        let layout = ChunkLayout::default();
        let mut keys = layout.chunk_keys("big", u32::MAX);
        assert_eq!(keys.next().as_deref(), Some("chunks/big/chunk_000000"));
        assert_eq!(keys.size_hint().0, u32::MAX as usize - 1);
    }

    #[test]
    fn prefix_slashes_are_trimmed() {
        let layout = ChunkLayout::new("/uploads/tmp/");
        assert_eq!(layout.prefix(), "uploads/tmp");
        assert_eq!(layout.chunk_key("s", 1), "uploads/tmp/s/chunk_000001");
    }

    #[test]
    fn empty_prefix() {
        let layout = ChunkLayout::new("");
        assert_eq!(layout.chunk_key("s", 3), "s/chunk_000003");
    }

    #[test]
    fn session_id_validation() {
        assert!(ChunkLayout::validate_session_id("3f2a-11").is_ok());
        assert!(ChunkLayout::validate_session_id("").is_err());
        assert!(ChunkLayout::validate_session_id("a/b").is_err());
        assert!(ChunkLayout::validate_session_id("..").is_err());
    }
}
