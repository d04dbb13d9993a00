//! Safetensors shard parsing: little-endian `u64` header length, then
//! `headerLen` bytes of UTF-8 JSON describing each tensor's dtype, shape,
//! and byte range, then the raw tensor payload.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{LoomError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct SafetensorsTensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [u64; 2],
}

pub struct SafetensorsFile<'a> {
    pub tensors: HashMap<String, SafetensorsTensorInfo>,
    payload: &'a [u8],
}

impl<'a> SafetensorsFile<'a> {
    /// Parse the header and validate every tensor's byte range against the
    /// payload length, rejecting out-of-bounds or overlapping ranges.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(LoomError::InvalidManifest {
                field: "safetensors".into(),
                reason: "file shorter than the 8-byte header length prefix".into(),
            });
        }
        let header_len = u64::from_le_bytes(data[0..8].try_into().unwrap()) as usize;
        if 8 + header_len > data.len() {
            return Err(LoomError::InvalidManifest {
                field: "safetensors".into(),
                reason: "header length exceeds file size".into(),
            });
        }

        let header_json = &data[8..8 + header_len];
        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(header_json)?;

        let mut tensors = HashMap::new();
        let payload = &data[8 + header_len..];

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for (name, value) in raw {
            if name == "__metadata__" {
                continue;
            }
            let info: SafetensorsTensorInfo = serde_json::from_value(value)?;
            let [begin, end] = info.data_offsets;
            if begin > end || end > payload.len() as u64 {
                return Err(LoomError::InvalidManifest {
                    field: format!("safetensors.{name}"),
                    reason: format!(
                        "data_offsets [{begin}, {end}] out of bounds (payload len {})",
                        payload.len()
                    ),
                });
            }
            for &(other_begin, other_end) in &ranges {
                if begin < other_end && other_begin < end {
                    return Err(LoomError::InvalidManifest {
                        field: format!("safetensors.{name}"),
                        reason: "overlapping data_offsets with another tensor".into(),
                    });
                }
            }
            ranges.push((begin, end));
            tensors.insert(name, info);
        }

        Ok(Self { tensors, payload })
    }

    pub fn tensor_bytes(&self, name: &str) -> Option<&'a [u8]> {
        let info = self.tensors.get(name)?;
        let [begin, end] = info.data_offsets;
        Some(&self.payload[begin as usize..end as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_file(header_json: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(header_json.len() as u64).to_le_bytes());
        out.extend_from_slice(header_json.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_single_tensor() {
        let header = r#"{"w":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]}}"#;
        let payload = vec![0u8; 16];
        let data = build_file(header, &payload);
        let file = SafetensorsFile::parse(&data).unwrap();
        assert_eq!(file.tensor_bytes("w").unwrap().len(), 16);
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let header =
            r#"{"a":{"dtype":"F32","shape":[1],"data_offsets":[0,8]},"b":{"dtype":"F32","shape":[1],"data_offsets":[4,12]}}"#;
        let payload = vec![0u8; 12];
        let data = build_file(header, &payload);
        assert!(SafetensorsFile::parse(&data).is_err());
    }

    #[test]
    fn rejects_out_of_bounds_range() {
        let header = r#"{"a":{"dtype":"F32","shape":[1],"data_offsets":[0,100]}}"#;
        let payload = vec![0u8; 4];
        let data = build_file(header, &payload);
        assert!(SafetensorsFile::parse(&data).is_err());
    }
}
