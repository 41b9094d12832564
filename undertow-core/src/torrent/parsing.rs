//! Torrent file and magnet link parsing.
//!
//! Metadata extraction using bencode-rs and magnet-url. Preserves the
//! announce-list tier structure (BEP 12) and the private flag, both of which
//! drive tracker scheduling and peer discovery policy.

use std::path::Path;

use async_trait::async_trait;
use sha1::{Digest, Sha1};

use super::{InfoHash, TorrentError};

// Type aliases for complex bencode types
type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;
type BytesResult<'a> = Result<&'a [u8], TorrentError>;
type FilesResult = ParseResult<(Vec<TorrentFile>, u64)>;

/// Complete metadata extracted from a torrent file.
///
/// Immutable once loaded; owned exclusively by the torrent's session.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
    /// Tracker tiers: each inner list is one tier of announce URLs, primary first.
    pub announce_tiers: Vec<Vec<String>>,
    /// Private torrents only ever receive peer candidates from trackers.
    pub private: bool,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    /// Unix timestamp of torrent creation, when the file records one.
    pub creation_date: Option<i64>,
}

impl TorrentMetadata {
    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Byte length of the given piece (the last piece may be short).
    pub fn piece_size(&self, piece: u32) -> u32 {
        let full = self.piece_length as u64;
        let start = piece as u64 * full;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(full) as u32
    }
}

/// Individual file within a torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Magnet link components.
///
/// Contains info hash and optional display name and tracker URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Abstract torrent parsing interface.
///
/// Implementations handle format-specific details while maintaining
/// consistent error handling and metadata extraction.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses torrent metadata from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or missing fields
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentMetadata, TorrentError>;

    /// Parses torrent file from filesystem path.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - File I/O error or parsing failure
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError>;

    /// Parses magnet link to extract torrent identity and trackers.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed magnet URI
    async fn parse_magnet_link(&self, magnet_url: &str) -> Result<MagnetLink, TorrentError>;
}

/// Reference implementation using bencode-rs and magnet-url.
#[derive(Default)]
pub struct MetainfoParser;

impl MetainfoParser {
    /// Creates new metainfo parser instance.
    pub fn new() -> Self {
        Self
    }

    /// Parse bencode data and extract torrent metadata
    fn parse_bencode_data(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        if parsed.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Empty bencode data".to_string(),
            });
        }

        let root = &parsed[0];
        if let bencode_rs::Value::Dictionary(dict) = root {
            Self::extract_metadata_from_dict(dict, torrent_bytes)
        } else {
            Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            })
        }
    }

    /// Extract torrent metadata from bencode dictionary
    fn extract_metadata_from_dict(
        dict: &BencodeDict<'_>,
        original_data: &[u8],
    ) -> ParseResult<TorrentMetadata> {
        let info_dict =
            dict.get(b"info".as_slice())
                .ok_or_else(|| TorrentError::InvalidTorrentFile {
                    reason: "Missing 'info' field".to_string(),
                })?;

        let info_hash = Self::calculate_info_hash(original_data)?;

        let bencode_rs::Value::Dictionary(info_dict_map) = info_dict else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Info field must be dictionary".to_string(),
            });
        };

        let name = Self::extract_bytes_as_string(info_dict_map, b"name")?;
        let piece_length = Self::extract_integer(info_dict_map, b"piece length")? as u32;

        let pieces_bytes = Self::extract_bytes(info_dict_map, b"pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid pieces length".to_string(),
            });
        }

        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length) =
            if let Ok(length) = Self::extract_integer(info_dict_map, b"length") {
                let files = vec![TorrentFile {
                    path: vec![name.clone()],
                    length: length as u64,
                }];
                (files, length as u64)
            } else if let Ok(bencode_rs::Value::List(files_list)) = info_dict_map
                .get(b"files".as_slice())
                .ok_or_else(|| TorrentError::InvalidTorrentFile {
                    reason: "Missing 'files' or 'length' field".to_string(),
                })
            {
                Self::extract_files_info(files_list)?
            } else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid files structure".to_string(),
                });
            };

        let private = matches!(
            info_dict_map.get(b"private".as_slice()),
            Some(bencode_rs::Value::Integer(1))
        );

        let announce_tiers = Self::extract_announce_tiers(dict)?;

        let comment = Self::extract_bytes_as_string(dict, b"comment").ok();
        let created_by = Self::extract_bytes_as_string(dict, b"created by").ok();
        let creation_date = Self::extract_integer(dict, b"creation date").ok();

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
            announce_tiers,
            private,
            comment,
            created_by,
            creation_date,
        })
    }

    /// Calculate SHA1 hash of the info dictionary
    fn calculate_info_hash(original_data: &[u8]) -> Result<InfoHash, TorrentError> {
        // Find the start of the info dictionary in the original data
        let info_start = original_data
            .windows(b"4:info".len())
            .position(|window| window == b"4:info")
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: "Could not find info dictionary in data".to_string(),
            })?;

        // Skip "4:info" to get to the actual dictionary
        let info_data_start = info_start + 6;

        let info_dict_data = &original_data[info_data_start..];
        let info_dict_end = Self::find_bencode_dictionary_end(info_dict_data)?;

        let info_dict_bytes = &original_data[info_data_start..info_data_start + info_dict_end];

        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        let hash_result = hasher.finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hash_result);

        Ok(InfoHash::new(hash))
    }

    /// Find the end position of a bencode dictionary
    fn find_bencode_dictionary_end(data: &[u8]) -> Result<usize, TorrentError> {
        if data.is_empty() || data[0] != b'd' {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Expected dictionary start".to_string(),
            });
        }

        let mut pos = 1; // Skip initial 'd'
        let mut depth = 1;

        while pos < data.len() && depth > 0 {
            match data[pos] {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    // Integer: find 'e'
                    pos += 1;
                    while pos < data.len() && data[pos] != b'e' {
                        pos += 1;
                    }
                    if pos < data.len() {
                        pos += 1; // Skip 'e'
                    }
                }
                b'0'..=b'9' => {
                    // String: read length
                    let start = pos;
                    while pos < data.len() && data[pos] != b':' {
                        pos += 1;
                    }
                    if pos >= data.len() {
                        return Err(TorrentError::InvalidTorrentFile {
                            reason: "Invalid string format".to_string(),
                        });
                    }

                    let length_str = std::str::from_utf8(&data[start..pos]).map_err(|_| {
                        TorrentError::InvalidTorrentFile {
                            reason: "Invalid string length".to_string(),
                        }
                    })?;
                    let length: usize =
                        length_str
                            .parse()
                            .map_err(|_| TorrentError::InvalidTorrentFile {
                                reason: "Invalid string length".to_string(),
                            })?;

                    pos += 1 + length; // Skip ':' and string content
                }
                _ => {
                    return Err(TorrentError::InvalidTorrentFile {
                        reason: "Invalid bencode character".to_string(),
                    });
                }
            }
        }

        if depth != 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Incomplete bencode dictionary".to_string(),
            });
        }

        Ok(pos)
    }

    /// Extract string from bencode dictionary
    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
        })
    }

    /// Extract bytes from bencode dictionary
    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> BytesResult<'a> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract integer from bencode dictionary
    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    /// Extract files information from multi-file torrent
    fn extract_files_info(files_list: &[bencode_rs::Value<'_>]) -> FilesResult {
        let mut files = Vec::new();
        let mut total_length = 0u64;

        for file_value in files_list {
            if let bencode_rs::Value::Dictionary(file_dict) = file_value {
                let length = Self::extract_integer(file_dict, b"length")? as u64;
                total_length += length;

                let path_list = match file_dict.get(b"path".as_slice()) {
                    Some(bencode_rs::Value::List(path_list)) => path_list,
                    _ => {
                        return Err(TorrentError::InvalidTorrentFile {
                            reason: "Missing or invalid path in file".to_string(),
                        });
                    }
                };

                let mut path = Vec::new();
                for path_component in path_list {
                    if let bencode_rs::Value::Bytes(component) = path_component {
                        let component_str =
                            String::from_utf8(component.to_vec()).map_err(|_| {
                                TorrentError::InvalidTorrentFile {
                                    reason: "Invalid UTF-8 in file path".to_string(),
                                }
                            })?;
                        path.push(component_str);
                    } else {
                        return Err(TorrentError::InvalidTorrentFile {
                            reason: "Invalid path component type".to_string(),
                        });
                    }
                }

                files.push(TorrentFile { path, length });
            } else {
                return Err(TorrentError::InvalidTorrentFile {
                    reason: "Invalid file entry type".to_string(),
                });
            }
        }

        Ok((files, total_length))
    }

    /// Extract announce tiers, preserving the BEP 12 tier structure.
    ///
    /// A bare `announce` key becomes a single one-URL tier. When an
    /// `announce-list` is present it takes precedence, with the bare URL
    /// folded into the first tier if not already listed.
    fn extract_announce_tiers(dict: &BencodeDict<'_>) -> ParseResult<Vec<Vec<String>>> {
        let mut tiers: Vec<Vec<String>> = Vec::new();

        if let Some(bencode_rs::Value::List(announce_list)) = dict.get(b"announce-list".as_slice())
        {
            for tier in announce_list {
                if let bencode_rs::Value::List(tier_urls) = tier {
                    let mut urls = Vec::new();
                    for url_value in tier_urls {
                        if let bencode_rs::Value::Bytes(url_bytes) = url_value {
                            if let Ok(url) = String::from_utf8(url_bytes.to_vec()) {
                                urls.push(url);
                            }
                        }
                    }
                    if !urls.is_empty() {
                        tiers.push(urls);
                    }
                }
            }
        }

        if let Ok(announce) = Self::extract_bytes_as_string(dict, b"announce") {
            let already_listed = tiers.iter().any(|tier| tier.contains(&announce));
            if tiers.is_empty() {
                tiers.push(vec![announce]);
            } else if !already_listed {
                tiers[0].insert(0, announce);
            }
        }

        if tiers.is_empty() {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "No announce URLs found".to_string(),
            });
        }

        Ok(tiers)
    }

    /// Extract info hash from magnet link
    fn extract_info_hash_from_magnet(
        magnet: &magnet_url::Magnet,
    ) -> Result<InfoHash, TorrentError> {
        let url_str = magnet.to_string();

        for param in url_str.split(['?', '&']) {
            if let Some(xt_value) = param.strip_prefix("xt=urn:btih:") {
                return Self::parse_hash_from_string(xt_value);
            }
        }

        Err(TorrentError::InvalidTorrentFile {
            reason: format!("Missing or invalid info hash in magnet link: {url_str}"),
        })
    }

    /// Parse hex string to 20-byte hash
    fn parse_hash_from_string(hash_str: &str) -> Result<InfoHash, TorrentError> {
        if hash_str.len() != 40 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Invalid hash length: {} (expected 40)", hash_str.len()),
            });
        }

        let decoded = hex::decode(hash_str).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid hex character in hash: {hash_str}"),
        })?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&decoded);
        Ok(InfoHash::new(hash))
    }
}

#[async_trait]
impl TorrentParser for MetainfoParser {
    async fn parse_torrent_data(
        &self,
        torrent_bytes: &[u8],
    ) -> Result<TorrentMetadata, TorrentError> {
        Self::parse_bencode_data(torrent_bytes)
    }

    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let file_contents = tokio::fs::read(path).await?;

        self.parse_torrent_data(&file_contents).await
    }

    async fn parse_magnet_link(&self, magnet_url: &str) -> Result<MagnetLink, TorrentError> {
        let magnet =
            magnet_url::Magnet::new(magnet_url).map_err(|e| TorrentError::InvalidTorrentFile {
                reason: format!("Invalid magnet link: {e}"),
            })?;

        let info_hash = Self::extract_info_hash_from_magnet(&magnet)?;

        Ok(MagnetLink {
            info_hash,
            display_name: magnet.display_name().map(|s| s.to_string()),
            trackers: magnet.trackers().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_magnet_link_parsing() {
        let parser = MetainfoParser::new();

        let magnet_url = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Test%20Torrent&tr=http://tracker.example.com/announce";
        let result = parser.parse_magnet_link(magnet_url).await;

        assert!(result.is_ok());
        let magnet = result.unwrap();
        assert_eq!(
            magnet.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(magnet.trackers, vec!["http://tracker.example.com/announce"]);
    }

    #[tokio::test]
    async fn test_invalid_magnet_link() {
        let parser = MetainfoParser::new();

        let result = parser.parse_magnet_link("invalid://not-a-magnet").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_torrent_data_parsing() {
        let parser = MetainfoParser::new();

        let torrent_data = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";
        let result = parser.parse_torrent_data(torrent_data).await;

        assert!(result.is_ok());
        let metadata = result.unwrap();
        assert_eq!(metadata.name, "test.txt");
        assert_eq!(metadata.piece_length, 32768);
        assert_eq!(metadata.total_length, 1000);
        assert_eq!(metadata.piece_hashes.len(), 1);
        assert_eq!(metadata.announce_tiers, vec![vec!["test:8080".to_string()]]);
        assert!(!metadata.private);
    }

    #[tokio::test]
    async fn test_private_flag() {
        let parser = MetainfoParser::new();

        let torrent_data = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:123456789012345678907:privatei1eee";
        let metadata = parser.parse_torrent_data(torrent_data).await.unwrap();
        assert!(metadata.private);
    }

    #[tokio::test]
    async fn test_announce_list_tiers() {
        let parser = MetainfoParser::new();

        // announce-list with two tiers; bare announce already in tier one
        let torrent_data = b"d8:announce12:http://a/ann13:announce-listll12:http://a/ann12:http://b/annel12:http://c/annee4:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";
        let metadata = parser.parse_torrent_data(torrent_data).await.unwrap();

        assert_eq!(metadata.announce_tiers.len(), 2);
        assert_eq!(metadata.announce_tiers[0].len(), 2);
        assert_eq!(metadata.announce_tiers[0][0], "http://a/ann");
        assert_eq!(metadata.announce_tiers[1], vec!["http://c/ann"]);
    }

    #[tokio::test]
    async fn test_invalid_torrent_data() {
        let parser = MetainfoParser::new();

        let invalid_data = b"invalid torrent data";
        let result = parser.parse_torrent_data(invalid_data).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_torrent_file_parsing() {
        let parser = MetainfoParser::new();

        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test.torrent");
        let torrent_data = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";

        tokio::fs::write(&file_path, torrent_data).await.unwrap();

        let result = parser.parse_torrent_file(&file_path).await;
        assert!(result.is_ok());

        let metadata = result.unwrap();
        assert_eq!(metadata.name, "test.txt");
        assert_eq!(metadata.total_length, 1000);
    }

    #[tokio::test]
    async fn test_missing_info_field() {
        let parser = MetainfoParser::new();
        let torrent_data = b"d8:announce9:test:8080e"; // Missing info field
        let result = parser.parse_torrent_data(torrent_data).await;

        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("Missing 'info' field"));
        }
    }

    #[tokio::test]
    async fn test_invalid_pieces_length() {
        let parser = MetainfoParser::new();
        let torrent_data = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces19:1234567890123456789ee";
        let result = parser.parse_torrent_data(torrent_data).await;

        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("Invalid pieces length"));
        }
    }

    #[tokio::test]
    async fn test_multi_file_torrent() {
        let parser = MetainfoParser::new();
        let torrent_data = b"d8:announce9:test:80804:infod4:name8:test.dir5:filesld6:lengthi500e4:pathl5:file1eed6:lengthi300e4:pathl5:file2eee12:piece lengthi32768e6:pieces40:12345678901234567890ABCDEFGHIJ1234567890ee";
        let metadata = parser.parse_torrent_data(torrent_data).await.unwrap();

        assert_eq!(metadata.total_length, 800);
        assert_eq!(metadata.files.len(), 2);
        assert_eq!(metadata.files[0].path, vec!["file1"]);
    }

    #[test]
    fn test_piece_size_final_piece() {
        let metadata = TorrentMetadata {
            info_hash: InfoHash::new([0u8; 20]),
            name: "test".to_string(),
            piece_length: 32768,
            piece_hashes: vec![[0u8; 20]; 4],
            total_length: 3 * 32768 + 100,
            files: vec![],
            announce_tiers: vec![vec!["http://t/announce".to_string()]],
            private: false,
            comment: None,
            created_by: None,
            creation_date: None,
        };

        assert_eq!(metadata.piece_size(0), 32768);
        assert_eq!(metadata.piece_size(2), 32768);
        assert_eq!(metadata.piece_size(3), 100);
    }

    #[tokio::test]
    async fn test_info_hash_consistency() {
        let parser = MetainfoParser::new();

        let torrent_data = b"d8:announce9:test:80804:infod6:lengthi1000e4:name8:test.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";
        let result1 = parser.parse_torrent_data(torrent_data).await.unwrap();
        let result2 = parser.parse_torrent_data(torrent_data).await.unwrap();
        assert_eq!(result1.info_hash, result2.info_hash);

        let other = b"d8:announce9:test:80804:infod6:lengthi2000e4:name9:test2.txt12:piece lengthi32768e6:pieces20:12345678901234567890ee";
        let result3 = parser.parse_torrent_data(other).await.unwrap();
        assert_ne!(result1.info_hash, result3.info_hash);
    }

    #[test]
    fn test_bencode_dictionary_end_parsing() {
        let simple_dict = b"d4:name4:teste";
        let end = MetainfoParser::find_bencode_dictionary_end(simple_dict).unwrap();
        assert_eq!(end, simple_dict.len());

        let nested_dict = b"d4:infod4:name4:testee";
        let end = MetainfoParser::find_bencode_dictionary_end(nested_dict).unwrap();
        assert_eq!(end, nested_dict.len());

        let dict_with_int = b"d4:sizei1000e4:name4:teste";
        let end = MetainfoParser::find_bencode_dictionary_end(dict_with_int).unwrap();
        assert_eq!(end, dict_with_int.len());
    }
}
