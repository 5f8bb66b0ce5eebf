use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::SkillsConfig;
use crate::sandbox::{shell_quote, SandboxDriver, SandboxError};

pub const SKILLS_MANIFEST_FILENAME: &str = ".skills_manifest.json";
const UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillFileMeta {
    pub size: u64,
    pub mtime_ns: u64,
}

/// Cheap content manifest over the local skill roots, used to detect drift
/// against the sandbox-resident copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillsManifest {
    pub version: String,
    pub files: BTreeMap<String, SkillFileMeta>,
}

impl SkillsManifest {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn file_mtime_ns(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Scan the skill roots in precedence order and build the manifest.
///
/// A skill is a child directory containing `SKILL.md`; every plain file in it
/// is recorded as `skill/file`. When a later root repeats a skill name, the
/// earlier root's entries for that skill are discarded, mirroring the upload
/// behavior.
pub fn compute_manifest(local_skill_roots: &[String]) -> SkillsManifest {
    let mut files: BTreeMap<String, SkillFileMeta> = BTreeMap::new();
    let mut seen_skills: HashSet<String> = HashSet::new();

    for root in local_skill_roots {
        let root = Path::new(root);
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };

        for entry in entries.flatten() {
            let skill_dir = entry.path();
            if !skill_dir.is_dir() || !skill_dir.join("SKILL.md").is_file() {
                continue;
            }
            let skill_name = entry.file_name().to_string_lossy().into_owned();

            if !seen_skills.insert(skill_name.clone()) {
                let prefix = format!("{skill_name}/");
                files.retain(|path, _| !path.starts_with(&prefix));
            }

            let Ok(skill_entries) = std::fs::read_dir(&skill_dir) else {
                continue;
            };
            for file_entry in skill_entries.flatten() {
                let path = file_entry.path();
                if !path.is_file() {
                    continue;
                }
                let Ok(metadata) = file_entry.metadata() else {
                    continue;
                };
                let rel = format!(
                    "{skill_name}/{}",
                    file_entry.file_name().to_string_lossy()
                );
                files.insert(
                    rel,
                    SkillFileMeta {
                        size: metadata.len(),
                        mtime_ns: file_mtime_ns(&metadata),
                    },
                );
            }
        }
    }

    let payload: Vec<String> = files
        .iter()
        .map(|(path, meta)| format!("{path}:{}:{}", meta.size, meta.mtime_ns))
        .collect();
    let version = hex::encode(Sha256::digest(payload.join("\n").as_bytes()));

    SkillsManifest { version, files }
}

/// Ensure skills are present in the sandbox.
///
/// Uploads only when the sandbox is newly created or its manifest version
/// differs from the local one; returns whether an upload occurred.
pub async fn sync_skills(
    driver: &SandboxDriver,
    config: &SkillsConfig,
    reusing_sandbox: bool,
) -> Result<bool, SandboxError> {
    let local_manifest = compute_manifest(&config.local_skill_dirs);
    if local_manifest.is_empty() {
        return Ok(false);
    }

    let sandbox_base = config.sandbox_skills_base.trim_end_matches('/').to_string();
    let manifest_path = format!("{sandbox_base}/{SKILLS_MANIFEST_FILENAME}");

    // Missing or corrupt sandbox manifests mean "no manifest".
    let remote_version = driver
        .read_file_text(&manifest_path)
        .await?
        .and_then(|text| serde_json::from_str::<SkillsManifest>(&text).ok())
        .map(|m| m.version);

    let should_upload = !reusing_sandbox || remote_version.as_deref() != Some(&local_manifest.version);
    if !should_upload {
        debug!("skills manifest unchanged, skipping upload");
        return Ok(false);
    }

    upload_skills(driver, config, &local_manifest, &sandbox_base, &manifest_path).await?;
    Ok(true)
}

async fn upload_skills(
    driver: &SandboxDriver,
    config: &SkillsConfig,
    manifest: &SkillsManifest,
    sandbox_base: &str,
    manifest_path: &str,
) -> Result<(), SandboxError> {
    let semaphore = Arc::new(Semaphore::new(UPLOAD_CONCURRENCY));
    let mut uploaded_skills: HashSet<String> = HashSet::new();
    let mut uploads = Vec::new();
    let mut skill_count = 0usize;

    driver
        .exec_command(&format!("mkdir -p {}", shell_quote(sandbox_base)))
        .await?;

    for root in &config.local_skill_dirs {
        let root_path = Path::new(root);
        let Ok(entries) = std::fs::read_dir(root_path) else {
            debug!(%root, "skills directory not found");
            continue;
        };

        for entry in entries.flatten() {
            let skill_dir = entry.path();
            if !skill_dir.is_dir() || !skill_dir.join("SKILL.md").is_file() {
                continue;
            }
            let skill_name = entry.file_name().to_string_lossy().into_owned();
            let sandbox_skill_dir = format!("{sandbox_base}/{skill_name}");

            // A later root overriding an earlier one replaces the whole skill
            // directory so stale files never linger.
            if uploaded_skills.contains(&skill_name) {
                driver
                    .exec_command(&format!("rm -rf {}", shell_quote(&sandbox_skill_dir)))
                    .await?;
            }
            driver
                .exec_command(&format!("mkdir -p {}", shell_quote(&sandbox_skill_dir)))
                .await?;
            uploaded_skills.insert(skill_name.clone());
            skill_count += 1;

            let Ok(skill_entries) = std::fs::read_dir(&skill_dir) else {
                continue;
            };
            for file_entry in skill_entries.flatten() {
                let local_file = file_entry.path();
                if !local_file.is_file() {
                    continue;
                }
                let sandbox_file = format!(
                    "{sandbox_skill_dir}/{}",
                    file_entry.file_name().to_string_lossy()
                );
                let semaphore = Arc::clone(&semaphore);
                uploads.push(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    let content = tokio::fs::read(&local_file).await.map_err(|e| {
                        SandboxError::Rejected(format!(
                            "failed to read {}: {e}",
                            local_file.display()
                        ))
                    })?;
                    driver.upload_file_bytes(&sandbox_file, &content).await
                });
            }
        }
    }

    let results = futures_util::future::join_all(uploads).await;
    for result in results {
        if let Err(e) = result {
            warn!(error = %e, "skill file upload failed");
        }
    }

    // The manifest lands last so a partial upload never looks complete.
    let manifest_bytes = serde_json::to_vec(manifest).expect("manifest serializes");
    driver
        .upload_file_bytes(manifest_path, &manifest_bytes)
        .await?;

    info!(
        skill_count,
        file_count = manifest.files.len(),
        %manifest_path,
        "uploaded skills to sandbox"
    );
    Ok(())
}

/// A skill injection request from the chat endpoint.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub name: String,
    pub instruction: Option<String>,
}

/// Load `SKILL.md` for a skill from the local roots; later roots win.
pub fn load_skill_content(skill_name: &str, skill_dirs: &[String]) -> Option<String> {
    let mut content = None;
    for dir in skill_dirs {
        let path = Path::new(dir).join(skill_name).join("SKILL.md");
        match std::fs::read_to_string(&path) {
            Ok(text) => content = Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(skill = %skill_name, path = %path.display(), error = %e, "failed to read SKILL.md"),
        }
    }
    if content.is_none() {
        warn!(skill = %skill_name, "SKILL.md not found in any skill directory");
    }
    content
}

/// Combine the requested skills into the synthetic user message prepended to
/// the conversation. Returns `None` when nothing could be loaded.
pub fn build_skill_prefix(skills: &[SkillContext], skill_dirs: &[String]) -> Option<String> {
    if skills.is_empty() {
        return None;
    }

    let mut sections = Vec::new();
    let mut instructions = Vec::new();

    for skill in skills {
        let Some(content) = load_skill_content(&skill.name, skill_dirs) else {
            continue;
        };
        if skills.len() > 1 {
            sections.push(format!("## Skill: {}\n{content}", skill.name));
        } else {
            sections.push(content);
        }
        if let Some(instruction) = &skill.instruction {
            instructions.push(format!("- {}: {instruction}", skill.name));
        }
    }

    if sections.is_empty() {
        return None;
    }

    let mut message = sections.join("\n\n");
    if !instructions.is_empty() {
        message.push_str("\n\nInstructions:\n");
        message.push_str(&instructions.join("\n"));
    }
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_skill(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("SKILL.md"), format!("# {name}")).unwrap();
        for (file, content) in files {
            fs::write(dir.join(file), content).unwrap();
        }
    }

    #[test]
    fn manifest_records_skill_files_with_metadata() {
        let root = TempDir::new().unwrap();
        write_skill(root.path(), "charting", &[("helper.py", "x = 1")]);
        // A directory without SKILL.md is not a skill.
        fs::create_dir_all(root.path().join("not-a-skill")).unwrap();
        fs::write(root.path().join("not-a-skill/readme.txt"), "hi").unwrap();

        let manifest = compute_manifest(&[root.path().to_string_lossy().into_owned()]);
        assert!(manifest.files.contains_key("charting/SKILL.md"));
        assert!(manifest.files.contains_key("charting/helper.py"));
        assert!(!manifest.files.keys().any(|k| k.starts_with("not-a-skill")));
        assert_eq!(manifest.version.len(), 64);
    }

    #[test]
    fn manifest_is_stable_without_changes() {
        let root = TempDir::new().unwrap();
        write_skill(root.path(), "charting", &[("helper.py", "x = 1")]);
        let roots = vec![root.path().to_string_lossy().into_owned()];

        let first = compute_manifest(&roots);
        let second = compute_manifest(&roots);
        assert_eq!(first, second);
    }

    #[test]
    fn later_roots_override_earlier_skills_entirely() {
        let user_root = TempDir::new().unwrap();
        let project_root = TempDir::new().unwrap();
        write_skill(
            user_root.path(),
            "charting",
            &[("old_only.py", "legacy"), ("shared.py", "user")],
        );
        write_skill(project_root.path(), "charting", &[("shared.py", "project")]);

        let manifest = compute_manifest(&[
            user_root.path().to_string_lossy().into_owned(),
            project_root.path().to_string_lossy().into_owned(),
        ]);

        // The earlier root's files for the overridden skill are gone.
        assert!(!manifest.files.contains_key("charting/old_only.py"));
        assert!(manifest.files.contains_key("charting/shared.py"));
        assert_eq!(
            manifest.files["charting/shared.py"].size,
            "project".len() as u64
        );
    }

    #[test]
    fn corrupt_remote_manifest_parses_to_none() {
        assert!(serde_json::from_str::<SkillsManifest>("{not json").is_err());
        assert!(serde_json::from_str::<SkillsManifest>("[1,2]").is_err());
    }

    #[test]
    fn skill_prefix_combines_content_and_instructions() {
        let root = TempDir::new().unwrap();
        write_skill(root.path(), "onboard", &[]);
        write_skill(root.path(), "review", &[]);
        let roots = vec![root.path().to_string_lossy().into_owned()];

        let skills = vec![
            SkillContext {
                name: "onboard".into(),
                instruction: Some("Help onboard".into()),
            },
            SkillContext {
                name: "review".into(),
                instruction: None,
            },
            SkillContext {
                name: "missing".into(),
                instruction: None,
            },
        ];

        let prefix = build_skill_prefix(&skills, &roots).unwrap();
        assert!(prefix.contains("## Skill: onboard"));
        assert!(prefix.contains("## Skill: review"));
        assert!(prefix.contains("- onboard: Help onboard"));

        assert!(build_skill_prefix(&[], &roots).is_none());
    }

    #[test]
    fn later_roots_win_when_loading_skill_content() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        write_skill(first.path(), "onboard", &[]);
        let dir = second.path().join("onboard");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("SKILL.md"), "# newer").unwrap();

        let content = load_skill_content(
            "onboard",
            &[
                first.path().to_string_lossy().into_owned(),
                second.path().to_string_lossy().into_owned(),
            ],
        )
        .unwrap();
        assert_eq!(content, "# newer");
    }
}
