//! Markdown rendering for the fixed registry tools.

use mcp_registry_catalog::{ActiveMount, Entry, RegistryStatus};

/// Render search hits with per-entry metadata.
#[must_use]
pub fn search_results(query: &str, results: &[Entry]) -> String {
    if results.is_empty() {
        return format!("No servers found matching query: {query}");
    }

    let mut out = vec![format!("# Found {} matching servers\n", results.len())];
    for (i, entry) in results.iter().enumerate() {
        out.push(format!("## {}. {}", i + 1, entry.name));
        out.push(format!("**ID:** `{}`", entry.id));
        out.push(format!("**Source:** {}", entry.source));
        out.push(format!("**Description:** {}", entry.description));
        if !entry.categories.is_empty() {
            out.push(format!("**Categories:** {}", entry.categories.join(", ")));
        }
        if !entry.tags.is_empty() {
            let shown: Vec<&str> = entry.tags.iter().take(5).map(String::as_str).collect();
            out.push(format!("**Tags:** {}", shown.join(", ")));
        }
        let mut flags = Vec::new();
        if entry.official {
            flags.push("Official");
        }
        if entry.featured {
            flags.push("Featured");
        }
        if entry.requires_api_key {
            flags.push("Requires API Key");
        }
        if !flags.is_empty() {
            out.push(format!("**Flags:** {}", flags.join(", ")));
        }
        if let Some(repo) = &entry.repo_url {
            out.push(format!("**Repository:** {repo}"));
        }
        if let Some(image) = &entry.container_image {
            out.push(format!("**Image:** {image}"));
        }
        out.push(String::new());
    }
    out.join("\n")
}

/// Render a flat registry listing.
#[must_use]
pub fn listing(entries: &[Entry], limit: usize) -> String {
    let mut out = vec![format!("# Registry listing ({} servers)\n", entries.len())];
    for entry in entries.iter().take(limit) {
        let mut flags = Vec::new();
        if entry.official {
            flags.push("Official");
        }
        if entry.featured {
            flags.push("Featured");
        }
        let flag_str = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        let description: String = entry.description.chars().take(100).collect();
        out.push(format!(
            "- **{}** (`{}`){} - {}",
            entry.name, entry.id, flag_str, description
        ));
    }
    if entries.len() > limit {
        out.push(format!("\n*({} more servers available)*", entries.len() - limit));
    }
    out.join("\n")
}

/// Render the active-mount table with discovered capability counts.
#[must_use]
pub fn active_mounts(mounts: &[ActiveMount]) -> String {
    if mounts.is_empty() {
        return "No active servers.".into();
    }

    let mut out = vec![format!("# Active servers ({})\n", mounts.len())];
    for mount in mounts {
        out.push(format!("## {}", mount.name));
        out.push(format!("**ID:** `{}`", mount.entry_id));
        out.push(format!("**Prefix:** `{}`", mount.prefix));
        if let Some(container) = &mount.container_id {
            out.push(format!("**Container:** {}", short(container)));
        }
        if let Some(pid) = mount.pid {
            out.push(format!("**PID:** {pid}"));
        }
        if !mount.environment.is_empty() {
            let mut keys: Vec<&str> = mount.environment.keys().map(String::as_str).collect();
            keys.sort_unstable();
            out.push(format!("**Environment:** {}", keys.join(", ")));
        }
        out.push(format!(
            "**Capabilities:** {} tools, {} resources, {} prompts",
            mount.tools.len(),
            mount.resources.len(),
            mount.prompts.len()
        ));
        out.push(format!(
            "**Mounted at:** {}",
            mount.mounted_at.format("%Y-%m-%d %H:%M:%S")
        ));
        out.push(String::new());
    }
    out.join("\n")
}

/// Render registry statistics and per-source refresh state.
#[must_use]
pub fn status(status: &RegistryStatus) -> String {
    let mut out = vec!["# Registry Status\n".to_string()];
    out.push(format!("**Total entries:** {}", status.total_entries));
    out.push(format!("**Active mounts:** {}", status.active_mounts));
    out.push(format!("**Cache directory:** {}", status.cache_dir));
    out.push(format!("**Sources directory:** {}", status.sources_dir));
    if let Some(last) = status.last_refresh_attempt {
        out.push(format!("**Last refresh:** {}", last.format("%Y-%m-%d %H:%M:%S")));
    }

    out.push("\n## Sources\n".to_string());
    for (name, source) in &status.sources {
        out.push(format!("### {name}"));
        out.push(format!("**Entries:** {}", source.entry_count));
        out.push(format!("**Status:** {}", source.status));
        if let Some(refreshed) = source.last_refresh {
            out.push(format!("**Last refresh:** {}", refreshed.to_rfc3339()));
        }
        if let Some(error) = &source.error_message {
            out.push(format!("**Error:** {error}"));
        }
        out.push(String::new());
    }
    out.join("\n")
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_registry_catalog::SourceType;

    #[test]
    fn empty_search_has_a_clear_message() {
        assert!(search_results("db", &[]).contains("No servers found"));
    }

    #[test]
    fn search_results_carry_flags_and_ids() {
        let mut entry = Entry::new("docker/pg", "Postgres", "SQL server", SourceType::Docker)
            .expect("valid entry");
        entry.official = true;
        entry.container_image = Some("docker.io/mcp/postgres".into());

        let text = search_results("postgres", &[entry]);
        assert!(text.contains("`docker/pg`"));
        assert!(text.contains("Official"));
        assert!(text.contains("docker.io/mcp/postgres"));
    }

    #[test]
    fn listing_truncates_and_reports_overflow() {
        let entries: Vec<Entry> = (0..4)
            .map(|i| {
                Entry::new(format!("e{i}"), format!("E{i}"), "d", SourceType::Custom).unwrap()
            })
            .collect();
        let text = listing(&entries, 2);
        assert!(text.contains("2 more servers available"));
    }

    #[test]
    fn no_active_servers_message() {
        assert_eq!(active_mounts(&[]), "No active servers.");
    }
}
