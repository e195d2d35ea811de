use serde::{ Deserialize, Serialize };
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

impl ModelStatus {
    /// Allowed edges: Unloaded -> Loading -> Loaded, Loading -> Error,
    /// Error -> Loading, Loaded -> Unloaded.
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Unloaded, Loading) |
                (Error, Loading) |
                (Loading, Loaded) |
                (Loading, Error) |
                (Loaded, Unloaded)
        )
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Unloaded => "unloaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Loaded => "loaded",
            ModelStatus::Error => "error",
        };
        f.pad(s)
    }
}

/// One entry of `GET /api/models`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub parameters: Option<String>,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub chat_template: Option<String>,
    pub status: ModelStatus,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ModelEntry {
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadParams {
    pub ctx_size: u32,
    pub n_gpu_layers: i32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            ctx_size: 4096,
            n_gpu_layers: -1,
        }
    }
}

pub fn format_size(bytes: u64) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GIB {
        format!("{:.1} GiB", b / GIB)
    } else {
        format!("{:.1} MiB", b / MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_documented_transitions_are_allowed() {
        use ModelStatus::*;
        let all = [Unloaded, Loading, Loaded, Error];
        let allowed: Vec<(ModelStatus, ModelStatus)> = all
            .iter()
            .flat_map(|a| all.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition_to(*b))
            .collect();
        assert_eq!(
            allowed,
            vec![(Unloaded, Loading), (Loading, Loaded), (Loading, Error), (Loaded, Unloaded), (Error, Loading)]
        );
    }

    #[test]
    fn entry_parses_server_payload() {
        let json = r#"{
            "id": "qwen2.5-7b",
            "filename": "qwen2.5-7b.Q4_K_M.gguf",
            "path": "/models/qwen2.5-7b.Q4_K_M.gguf",
            "size": 4683073536,
            "architecture": "qwen2",
            "parameters": null,
            "context_length": 32768,
            "file_type": "Q4_K_M",
            "quantization": "Q4_K_M",
            "chat_template": null,
            "status": "unloaded",
            "favorite": false,
            "alias": null
        }"#;
        let entry: ModelEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.status, ModelStatus::Unloaded);
        assert_eq!(entry.context_length, Some(32768));
        assert_eq!(entry.display_name(), "qwen2.5-7b");
    }

    #[test]
    fn load_params_default_to_server_defaults() {
        let json = serde_json::to_value(LoadParams::default()).unwrap();
        assert_eq!(json, serde_json::json!({ "ctx_size": 4096, "n_gpu_layers": -1 }));
    }

    #[test]
    fn sizes_render_in_binary_units() {
        assert_eq!(format_size(4 * 1024 * 1024 * 1024), "4.0 GiB");
        assert_eq!(format_size(512 * 1024 * 1024), "512.0 MiB");
    }
}
