use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::provider::ImageSpec;
use crate::config::SandboxConfig;

/// Python version baked into snapshots. Pinned independently of the
/// configured interpreter so existing snapshots stay valid.
pub const SNAPSHOT_PYTHON_VERSION: &str = "3.12";

/// Python dependencies preinstalled in every snapshot image.
pub const DEFAULT_DEPENDENCIES: &[&str] = &[
    "mcp",
    "fastmcp",
    "pandas",
    "requests",
    "aiohttp",
    "httpx[http2]",
    "numpy",
    "scipy",
    "scikit-learn",
    "statsmodels",
    "matplotlib",
    "seaborn",
    "plotly",
    "pillow",
    "openpyxl",
    "beautifulsoup4",
    "lxml",
    "pyyaml",
    "tqdm",
    "tabulate",
];

/// System packages installed by the image build, part of the snapshot hash.
pub const APT_PACKAGES: &[&str] = &["curl", "nodejs", "ripgrep", "uv", "jq", "git", "unzip"];

/// Deterministic 8-hex-char hash over everything that shapes the snapshot.
/// Package lists are sorted first so config ordering never changes the hash.
pub fn snapshot_hash(config: &SandboxConfig, mcp_packages: &[String]) -> String {
    let mut dependencies: Vec<String> = DEFAULT_DEPENDENCIES
        .iter()
        .map(|d| d.to_string())
        .chain(config.dependencies.iter().cloned())
        .collect();
    dependencies.sort();
    dependencies.dedup();

    let mut mcp_sorted: Vec<String> = mcp_packages.to_vec();
    mcp_sorted.sort();

    let mut payload: BTreeMap<&str, Value> = BTreeMap::new();
    payload.insert("python_version", json!(SNAPSHOT_PYTHON_VERSION));
    payload.insert("dependencies", json!(dependencies));
    payload.insert("mcp_packages", json!(mcp_sorted));
    payload.insert("apt_packages", json!(APT_PACKAGES));

    let canonical = serde_json::to_string(&payload).expect("snapshot payload serializes");
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..8].to_string()
}

pub fn snapshot_name(config: &SandboxConfig, mcp_packages: &[String]) -> String {
    format!("{}-{}", config.snapshot_name, snapshot_hash(config, mcp_packages))
}

/// Declarative image definition for the snapshot build: system deps, Node
/// runtime, global MCP npm packages, then the pip dependency set.
pub fn snapshot_image(config: &SandboxConfig, mcp_packages: &[String]) -> ImageSpec {
    let mut run_commands = vec![
        "apt-get update".to_string(),
        "apt-get install -y curl ripgrep jq git unzip".to_string(),
        "curl -LsSf https://astral.sh/uv/install.sh | sh".to_string(),
        "mv /root/.local/bin/uv /usr/local/bin/uv".to_string(),
        "curl -fsSL https://deb.nodesource.com/setup_20.x | bash -".to_string(),
        "apt-get install -y nodejs".to_string(),
    ];
    for package in mcp_packages {
        run_commands.push(format!("npm install -g {package}"));
    }
    run_commands.push("apt-get clean".to_string());
    run_commands.push("rm -rf /var/lib/apt/lists/*".to_string());

    let pip_packages = DEFAULT_DEPENDENCIES
        .iter()
        .map(|d| d.to_string())
        .chain(config.dependencies.iter().cloned())
        .collect();

    ImageSpec {
        base_image: format!("python:{SNAPSHOT_PYTHON_VERSION}-slim"),
        run_commands,
        pip_packages,
        workdir: "/home/sandbox".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_under_package_permutation() {
        let mut config = SandboxConfig::default();
        config.dependencies = vec!["pandas".into(), "numpy".into()];
        let a = snapshot_hash(&config, &["a".into(), "b".into()]);

        config.dependencies = vec!["numpy".into(), "pandas".into()];
        let b = snapshot_hash(&config, &["b".into(), "a".into()]);

        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn hash_changes_when_packages_change() {
        let config = SandboxConfig::default();
        let base = snapshot_hash(&config, &[]);
        let with_mcp = snapshot_hash(&config, &["@modelcontextprotocol/server-filesystem".into()]);
        assert_ne!(base, with_mcp);
    }

    #[test]
    fn snapshot_name_carries_the_base_and_hash() {
        let config = SandboxConfig::default();
        let name = snapshot_name(&config, &[]);
        assert!(name.starts_with("agenthost-base-"));
        assert_eq!(name.len(), "agenthost-base-".len() + 8);
    }

    #[test]
    fn image_installs_mcp_packages_globally() {
        let config = SandboxConfig::default();
        let image = snapshot_image(&config, &["pkg-x".into()]);
        assert!(image
            .run_commands
            .iter()
            .any(|c| c == "npm install -g pkg-x"));
        assert!(image.pip_packages.contains(&"pandas".to_string()));
    }
}
