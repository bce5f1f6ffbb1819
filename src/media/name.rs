//! Media name grammar
//!
//! `[ "/" ] [ db "/" ] doc [ "/" attachment ]` where a leading slash is
//! tolerated, a missing db implies the default media database, and a
//! missing attachment means "first declared attachment".

/// A parsed media name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaName {
    /// Database the document lives in, when named explicitly
    pub db: Option<String>,
    /// Document id
    pub doc: String,
    /// Attachment name, when named explicitly
    pub attachment: Option<String>,
}

impl MediaName {
    /// Parse a raw media name; `None` means the name cannot resolve
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.strip_prefix('/').unwrap_or(raw);
        if raw.is_empty() {
            return None;
        }
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [doc] if !doc.is_empty() => Some(Self {
                db: None,
                doc: doc.to_string(),
                attachment: None,
            }),
            [db, doc] if !db.is_empty() && !doc.is_empty() => Some(Self {
                db: Some(db.to_string()),
                doc: doc.to_string(),
                attachment: None,
            }),
            [db, doc, attachment] if !db.is_empty() && !doc.is_empty() && !attachment.is_empty() => {
                Some(Self {
                    db: Some(db.to_string()),
                    doc: doc.to_string(),
                    attachment: Some(attachment.to_string()),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_only() {
        let name = MediaName::parse("greeting.wav").unwrap();
        assert_eq!(name.db, None);
        assert_eq!(name.doc, "greeting.wav");
        assert_eq!(name.attachment, None);
    }

    #[test]
    fn test_leading_slash_tolerated() {
        let name = MediaName::parse("/greeting.wav").unwrap();
        assert_eq!(name.doc, "greeting.wav");
    }

    #[test]
    fn test_db_and_doc() {
        let name = MediaName::parse("system_media/ringback").unwrap();
        assert_eq!(name.db.as_deref(), Some("system_media"));
        assert_eq!(name.doc, "ringback");
        assert_eq!(name.attachment, None);
    }

    #[test]
    fn test_explicit_attachment() {
        let name = MediaName::parse("/system_media/ringback/uk.wav").unwrap();
        assert_eq!(name.db.as_deref(), Some("system_media"));
        assert_eq!(name.doc, "ringback");
        assert_eq!(name.attachment.as_deref(), Some("uk.wav"));
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(MediaName::parse(""), None);
        assert_eq!(MediaName::parse("/"), None);
        assert_eq!(MediaName::parse("db//doc"), None);
        assert_eq!(MediaName::parse("a/b/c/d"), None);
    }
}
