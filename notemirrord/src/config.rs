use std::path::PathBuf;

use anyhow::Context;

use crate::sync::coordinator::SyncOptions;

const DEFAULT_OUTPUT_DIR: &str = "notemirror";
const DEFAULT_CONCURRENCY: i32 = 3;

#[derive(Clone, Debug)]
pub struct RunConfig {
    pub token: String,
    pub output_root: PathBuf,
    pub roots: Vec<String>,
    pub api_base_url: Option<String>,
    pub options: SyncOptions,
}

impl RunConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let token =
            std::env::var("NOTEMIRROR_TOKEN").context("NOTEMIRROR_TOKEN is not set")?;
        let output_root = std::env::var("NOTEMIRROR_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let roots = std::env::var("NOTEMIRROR_ROOTS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let api_base_url = std::env::var("NOTEMIRROR_API_BASE_URL").ok();

        let options = SyncOptions {
            recursive: read_bool_env("NOTEMIRROR_RECURSIVE", true),
            include_resources: read_bool_env("NOTEMIRROR_INCLUDE_RESOURCES", true),
            concurrency_limit: read_i32_env("NOTEMIRROR_CONCURRENCY", DEFAULT_CONCURRENCY),
            enable_cache: read_bool_env("NOTEMIRROR_ENABLE_CACHE", true),
        };

        Ok(Self {
            token,
            output_root,
            roots,
            api_base_url,
            options,
        })
    }
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn read_i32_env(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_parser_accepts_common_spellings() {
        assert!(read_bool_env("NOTEMIRROR_TEST_UNSET_BOOL", true));
        assert!(!read_bool_env("NOTEMIRROR_TEST_UNSET_BOOL", false));
    }

    #[test]
    fn i32_env_parser_falls_back_to_default() {
        assert_eq!(read_i32_env("NOTEMIRROR_TEST_UNSET_I32", 7), 7);
    }
}
