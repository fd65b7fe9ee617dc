use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::StorageError;
use crate::tools::ToolSummary;

/// The six identity slots, all optional. Reconstructed from disk on every
/// loop iteration so external edits take effect on the next model call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityFiles {
    pub soul: Option<String>,
    pub identity: Option<String>,
    pub user: Option<String>,
    pub memory: Option<String>,
    pub agents: Option<String>,
    pub tools: Option<String>,
}

fn read_optional(dir: &Path, name: &str) -> Result<Option<String>, StorageError> {
    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io { path, source: e }),
    }
}

/// Read the six fixed identity files. Missing files are simply absent;
/// any other IO failure propagates.
pub fn load_identity_files(home_dir: &Path) -> Result<IdentityFiles, StorageError> {
    Ok(IdentityFiles {
        soul: read_optional(home_dir, "SOUL.md")?,
        identity: read_optional(home_dir, "IDENTITY.md")?,
        user: read_optional(home_dir, "USER.md")?,
        memory: read_optional(home_dir, "MEMORY.md")?,
        agents: read_optional(home_dir, "AGENTS.md")?,
        tools: read_optional(home_dir, "TOOLS.md")?,
    })
}

/// Assemble the system prompt. Section order is priority order: who the
/// entity is, what it can do, when it is, what it remembers, how it should
/// behave. Non-empty sections are joined by one blank line.
pub fn build_system_prompt(
    files: &IdentityFiles,
    tools: &[ToolSummary],
    now: DateTime<Utc>,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(soul) = trimmed(&files.soul) {
        sections.push(soul.to_string());
    }
    if let Some(identity) = trimmed(&files.identity) {
        sections.push(identity.to_string());
    }
    if let Some(user) = trimmed(&files.user) {
        sections.push(format!("## About the User\n\n{user}"));
    }

    let tools_md = trimmed(&files.tools);
    if !tools.is_empty() || tools_md.is_some() {
        let mut section = String::from("## Available Tools");
        if !tools.is_empty() {
            let list = tools
                .iter()
                .map(|t| format!("- **{}**: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n");
            section.push_str("\n\n");
            section.push_str(&list);
        }
        if let Some(md) = tools_md {
            section.push_str("\n\n");
            section.push_str(md);
        }
        sections.push(section);
    }

    sections.push(format!(
        "## Current Time\n\n{}",
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    if let Some(memory) = trimmed(&files.memory) {
        sections.push(format!("## Memory\n\n{memory}"));
    }
    if let Some(agents) = trimmed(&files.agents) {
        sections.push(format!("## Guidelines\n\n{agents}"));
    }

    sections.join("\n\n")
}

fn trimmed(slot: &Option<String>) -> Option<&str> {
    slot.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn missing_files_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "SOUL.md", "I am.");
        let files = load_identity_files(dir.path()).unwrap();
        assert_eq!(files.soul.as_deref(), Some("I am."));
        assert!(files.identity.is_none());
        assert!(files.memory.is_none());
    }

    #[test]
    fn loading_twice_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "SOUL.md", "I am.");
        write(dir.path(), "MEMORY.md", "Things happened.");
        let first = load_identity_files(dir.path()).unwrap();
        let second = load_identity_files(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let files = IdentityFiles {
            soul: Some("SOUL TEXT".into()),
            identity: Some("IDENTITY TEXT".into()),
            user: Some("USER TEXT".into()),
            memory: Some("MEMORY TEXT".into()),
            agents: Some("AGENTS TEXT".into()),
            tools: Some("TOOLS TEXT".into()),
        };
        let tools = vec![ToolSummary {
            name: "calc".into(),
            description: "Evaluate arithmetic".into(),
        }];
        let prompt = build_system_prompt(&files, &tools, t0());

        let order = [
            "SOUL TEXT",
            "IDENTITY TEXT",
            "## About the User\n\nUSER TEXT",
            "## Available Tools\n\n- **calc**: Evaluate arithmetic\n\nTOOLS TEXT",
            "## Current Time\n\n2025-06-01T12:00:00Z",
            "## Memory\n\nMEMORY TEXT",
            "## Guidelines\n\nAGENTS TEXT",
        ];
        let mut cursor = 0;
        for part in order {
            let at = prompt[cursor..]
                .find(part)
                .unwrap_or_else(|| panic!("missing or out of order: {part}"));
            cursor += at + part.len();
        }
    }

    #[test]
    fn soul_and_identity_are_unheadered() {
        let files = IdentityFiles {
            soul: Some("raw soul".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&files, &[], t0());
        assert!(prompt.starts_with("raw soul\n\n## Current Time"));
    }

    #[test]
    fn tools_section_omitted_when_nothing_to_say() {
        let prompt = build_system_prompt(&IdentityFiles::default(), &[], t0());
        assert!(!prompt.contains("## Available Tools"));
        assert!(prompt.contains("## Current Time"));
    }

    #[test]
    fn tools_md_alone_still_emits_section() {
        let files = IdentityFiles {
            tools: Some("Use them wisely.".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&files, &[], t0());
        assert!(prompt.contains("## Available Tools\n\nUse them wisely."));
    }

    #[test]
    fn file_contents_are_trimmed() {
        let files = IdentityFiles {
            memory: Some("\n\n  remembered  \n".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&files, &[], t0());
        assert!(prompt.contains("## Memory\n\nremembered"));
    }

    #[test]
    fn whitespace_only_file_is_treated_as_absent() {
        let files = IdentityFiles {
            agents: Some("   \n  ".into()),
            ..Default::default()
        };
        let prompt = build_system_prompt(&files, &[], t0());
        assert!(!prompt.contains("## Guidelines"));
    }
}
