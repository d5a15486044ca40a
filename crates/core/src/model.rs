//! Model descriptors: the unvalidated [`ModelSpec`] and the validated [`Model`].

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::types::{DataType, Layout};

/// Loosely-typed model description as supplied by a caller or config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSpec {
    pub name: Option<String>,
    pub url: Option<String>,
    pub channel: Option<u32>,
    pub data_type: Option<String>,
    pub layout: Option<String>,
    pub tile_size: Option<u32>,
}

/// Validated description of the network a run targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub name: String,
    pub url: String,
    pub channel: usize,
    pub data_type: DataType,
    pub layout: Layout,
    pub tile_size: Option<usize>,
}

impl ModelSpec {
    /// Check every field and build a [`Model`], listing all problems at once.
    pub fn validate(&self) -> Result<Model, PipelineError> {
        let mut fields = Vec::new();

        let url = match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(url.to_string()),
            _ => {
                fields.push("url".to_string());
                None
            }
        };

        let channel = match self.channel {
            Some(c @ (3 | 4)) => Some(c as usize),
            Some(other) => {
                fields.push(format!("channel (expected 3 or 4, got {other})"));
                None
            }
            None => {
                fields.push("channel".to_string());
                None
            }
        };

        let data_type = match self.data_type.as_deref() {
            Some(token) => {
                let parsed = DataType::from_token(token);
                if parsed.is_none() {
                    fields.push(format!("dataType (unsupported '{token}')"));
                }
                parsed
            }
            None => {
                fields.push("dataType".to_string());
                None
            }
        };

        let layout = match self.layout.as_deref() {
            Some(token) => {
                let parsed = Layout::parse(token);
                if parsed.is_none() {
                    fields.push(format!("layout (unsupported '{token}')"));
                }
                parsed
            }
            None => {
                fields.push("layout".to_string());
                None
            }
        };

        if self.tile_size == Some(0) {
            fields.push("tileSize (must be positive)".to_string());
        }

        match (url, channel, data_type, layout) {
            (Some(url), Some(channel), Some(data_type), Some(layout)) if fields.is_empty() => {
                let name = self
                    .name
                    .clone()
                    .unwrap_or_else(|| model_name_from_url(&url));
                Ok(Model {
                    name,
                    url,
                    channel,
                    data_type,
                    layout,
                    tile_size: self.tile_size.map(|t| t as usize),
                })
            }
            _ => Err(PipelineError::Validation { fields }),
        }
    }
}

impl Model {
    /// Descriptor for a bare model location: 3-channel float32 NCHW.
    pub fn from_url(url: &str) -> Self {
        Self {
            name: model_name_from_url(url),
            url: url.to_string(),
            channel: 3,
            data_type: DataType::Float32,
            layout: Layout::NCHW,
            tile_size: None,
        }
    }

    /// Parse a path shaped like `.../{channel}/{dataType}/{layout}/{name}.onnx`.
    pub fn from_formatted_path(path: &str) -> Result<Self, PipelineError> {
        let segments: Vec<&str> = path
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .collect();

        let l = segments.len();
        let file = segments.last().copied().unwrap_or_default();
        if l < 4 || !file.to_ascii_lowercase().ends_with(".onnx") {
            return Err(PipelineError::Validation {
                fields: vec![format!(
                    "url ('{path}' is not shaped like <channel>/<dataType>/<layout>/<name>.onnx)"
                )],
            });
        }

        let spec = ModelSpec {
            name: Some(file[..file.len() - ".onnx".len()].to_string()),
            url: Some(path.to_string()),
            channel: segments[l - 4].parse().ok(),
            data_type: Some(segments[l - 3].to_string()),
            layout: Some(segments[l - 2].to_ascii_uppercase()),
            tile_size: None,
        };

        if spec.channel.is_none() {
            return Err(PipelineError::Validation {
                fields: vec![format!("channel ('{}' is not a number)", segments[l - 4])],
            });
        }

        spec.validate()
    }

    pub fn with_tile_size(mut self, tile_size: Option<usize>) -> Self {
        self.tile_size = tile_size.filter(|t| *t > 0);
        self
    }

    /// Dimension vector of a `height x width` chunk under this model's layout.
    pub fn chunk_dims(&self, height: usize, width: usize) -> [usize; 4] {
        self.layout.dims(1, self.channel, height, width)
    }
}

fn model_name_from_url(url: &str) -> String {
    let file = url.rsplit(['/', '\\']).next().unwrap_or(url);
    file.strip_suffix(".onnx")
        .or_else(|| file.strip_suffix(".ONNX"))
        .unwrap_or(file)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_spec() -> ModelSpec {
        ModelSpec {
            name: None,
            url: Some("models/4x-real.onnx".to_string()),
            channel: Some(3),
            data_type: Some("float32".to_string()),
            layout: Some("nchw".to_string()),
            tile_size: None,
        }
    }

    #[test]
    fn test_validate_complete_spec() {
        let model = full_spec().validate().expect("spec should validate");
        assert_eq!(model.name, "4x-real");
        assert_eq!(model.channel, 3);
        assert_eq!(model.data_type, DataType::Float32);
        assert_eq!(model.layout, Layout::NCHW);
        assert_eq!(model.tile_size, None);
    }

    #[test]
    fn test_validate_lists_every_missing_field() {
        let err = ModelSpec::default().validate().expect_err("empty spec must fail");
        match err {
            PipelineError::Validation { fields } => {
                assert_eq!(fields, vec!["url", "channel", "dataType", "layout"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_tile_size_is_optional_but_positive() {
        let mut spec = full_spec();
        spec.tile_size = Some(64);
        assert_eq!(spec.validate().expect("valid").tile_size, Some(64));

        spec.tile_size = Some(0);
        let err = spec.validate().expect_err("zero tile must fail");
        assert!(err.to_string().contains("tileSize"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut spec = full_spec();
        spec.channel = Some(1);
        spec.layout = Some("NCHX".to_string());
        let err = spec.validate().expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("channel (expected 3 or 4, got 1)"), "{msg}");
        assert!(msg.contains("layout (unsupported 'NCHX')"), "{msg}");
    }

    #[test]
    fn test_from_formatted_path() {
        let model = Model::from_formatted_path("/static/model/4/float16/nhwc/my-model_x2.onnx")
            .expect("formatted path should parse");
        assert_eq!(model.name, "my-model_x2");
        assert_eq!(model.channel, 4);
        assert_eq!(model.data_type, DataType::Float16);
        assert_eq!(model.layout, Layout::NHWC);
    }

    #[test]
    fn test_from_formatted_path_windows_separators() {
        let model = Model::from_formatted_path(r"static\model\3\float32\NCHW\x4.onnx")
            .expect("backslash path should parse");
        assert_eq!(model.channel, 3);
        assert_eq!(model.layout, Layout::NCHW);
    }

    #[test]
    fn test_from_formatted_path_rejects_short_paths() {
        assert!(Model::from_formatted_path("model.onnx").is_err());
        assert!(Model::from_formatted_path("x/float32/NCHW/m.onnx").is_err());
        assert!(Model::from_formatted_path("3/float32/NCHW/m.bin").is_err());
    }

    #[test]
    fn test_from_url_defaults() {
        let model = Model::from_url("https://example.com/m/ClearReality.onnx");
        assert_eq!(model.name, "ClearReality");
        assert_eq!(model.channel, 3);
        assert_eq!(model.data_type, DataType::Float32);
        assert_eq!(model.layout, Layout::NCHW);
    }

    #[test]
    fn test_spec_deserializes_camel_case() {
        let spec: ModelSpec = serde_json::from_str(
            r#"{"url":"m.onnx","channel":4,"dataType":"uint8","layout":"NHWC","tileSize":32}"#,
        )
        .expect("spec json should parse");
        let model = spec.validate().expect("valid");
        assert_eq!(model.tile_size, Some(32));
        assert_eq!(model.chunk_dims(10, 20), [1, 10, 20, 4]);
    }
}
