use serde::{Deserialize, Serialize};

/// Response body of `fs/stat/<alloc>?path=...`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    pub size: u64,
    #[serde(default)]
    pub file_mode: String,
    #[serde(default)]
    pub mod_time: String,
    #[serde(default)]
    pub content_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_response() {
        let info: FileInfo = serde_json::from_str(
            r#"{"Name":"web.stdout.0","IsDir":false,"Size":1200,"FileMode":"-rw-r--r--","ModTime":"2024-01-01T00:00:00Z","ContentType":"text/plain; charset=utf-8"}"#,
        )
        .unwrap();
        assert_eq!(info.size, 1200);
        assert!(!info.is_dir);
        assert_eq!(info.name, "web.stdout.0");
    }

    #[test]
    fn size_is_required() {
        assert!(serde_json::from_str::<FileInfo>(r#"{"Name":"x"}"#).is_err());
    }
}
