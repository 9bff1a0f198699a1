//! Project management: filesystem-backed registrations under the data root.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use grove_proto::{Request, RequestType};
use grove_types::paths;

use crate::client;
use crate::ui::{BOLD, CYAN, DIM, GREEN, RESET, YELLOW};

/// One registered project, as listed.
pub struct ProjectEntry {
    pub name: String,
    pub repo: String,
}

/// All registered projects, alphabetical by directory name.
pub fn load_entries() -> Vec<ProjectEntry> {
    let projects_dir = paths::projects_dir(&client::root_dir());
    let Ok(entries) = std::fs::read_dir(&projects_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect();
    dirs.sort();

    let mut projects = Vec::new();
    for dir in dirs {
        let Ok(content) = std::fs::read_to_string(dir.join("project.yaml")) else {
            continue;
        };
        #[derive(serde::Deserialize, Default)]
        struct FileShape {
            #[serde(default)]
            name: String,
            #[serde(default)]
            repo: String,
        }
        let Ok(parsed) = serde_yaml::from_str::<FileShape>(&content) else {
            continue;
        };
        let name = if parsed.name.is_empty() {
            dir.file_name().unwrap_or_default().to_string_lossy().to_string()
        } else {
            parsed.name
        };
        let repo = if parsed.repo.is_empty() {
            "(no repo)".to_string()
        } else {
            parsed.repo
        };
        projects.push(ProjectEntry { name, repo });
    }
    projects
}

/// Resolve a project argument that may be a 1-based index or a literal
/// name.
pub fn resolve(arg: &str) -> Result<String> {
    let Ok(n) = arg.parse::<usize>() else {
        return Ok(arg.to_string());
    };
    let entries = load_entries();
    if n < 1 || n > entries.len() {
        bail!(
            "project index {n} out of range (have {} project(s))",
            entries.len()
        );
    }
    Ok(entries[n - 1].name.clone())
}

pub fn create(name: &str, repo: Option<&str>) -> Result<()> {
    let project_dir = paths::project_dir(&client::root_dir(), name);
    let yaml_path = project_dir.join("project.yaml");
    if yaml_path.exists() {
        bail!("project {name:?} already exists at {}", project_dir.display());
    }
    std::fs::create_dir_all(&project_dir)
        .with_context(|| format!("create {}", project_dir.display()))?;
    let repo = repo.unwrap_or("");
    std::fs::write(&yaml_path, format!("name: {name}\nrepo: {repo}\n"))
        .with_context(|| format!("write {}", yaml_path.display()))?;

    println!("\n{GREEN}{BOLD}✓  Created project{RESET} {CYAN}{name:?}{RESET}\n");
    println!("{BOLD}Config:{RESET} {CYAN}{}{RESET}\n", yaml_path.display());
    println!("{BOLD}Next step:{RESET}\n");
    if repo.is_empty() {
        println!("  {BOLD}1.{RESET} Edit the file to set your repo URL");
        println!("  {BOLD}2.{RESET} Start an instance");
    } else {
        println!("  {BOLD}1.{RESET} Start an instance");
    }
    println!("     {DIM}grove start {name} <branch>{RESET}\n");
    Ok(())
}

pub fn list() {
    let entries = load_entries();
    if entries.is_empty() {
        println!("{DIM}no projects defined{RESET}");
        return;
    }
    println!("{BOLD}{:<4}  {:<20}  REPO{RESET}", "#", "NAME");
    println!("{DIM}{:<4}  {:<20}  ----{RESET}", "----", "--------------------");
    for (i, entry) in entries.iter().enumerate() {
        println!("{:<4}  {:<20}  {}", i + 1, entry.name, entry.repo);
    }
}

pub async fn delete(arg: &str) -> Result<()> {
    let name = resolve(arg)?;
    let project_dir = paths::project_dir(&client::root_dir(), &name);
    if !project_dir.join("project.yaml").exists() {
        bail!("project {name:?} not found");
    }

    // Count live instances so the warning can be specific.
    let mut instance_ids = Vec::new();
    if let Ok(resp) = client::try_request(&Request::new(RequestType::List)).await {
        for inst in resp.instances {
            if inst.project == name {
                instance_ids.push(inst.id);
            }
        }
    }

    println!("\n{YELLOW}{BOLD}⚠  Remove project{RESET} {CYAN}{name:?}{RESET}\n");
    if instance_ids.is_empty() {
        println!("  This will delete the project and {BOLD}all its worktrees{RESET}.\n");
    } else {
        println!(
            "  This will {BOLD}stop and remove {} instance(s){RESET}, delete all worktrees,",
            instance_ids.len()
        );
        println!("  and remove the project.\n");
    }
    if !confirm(&format!("{BOLD}Continue?{RESET} [y/N] "))? {
        println!("{DIM}aborted{RESET}");
        return Ok(());
    }

    for id in instance_ids {
        let _ = client::try_request(&Request::for_instance(RequestType::Drop, id)).await;
    }
    std::fs::remove_dir_all(&project_dir)
        .with_context(|| format!("remove {}", project_dir.display()))?;
    println!("\n{GREEN}{BOLD}✓  Deleted project{RESET} {CYAN}{name:?}{RESET}\n");
    Ok(())
}

pub fn dir(arg: &str) -> Result<()> {
    let name = resolve(arg)?;
    println!("{}", paths::main_dir(&client::root_dir(), &name).display());
    Ok(())
}

/// Prompt for a y/N answer on stdin.
pub fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(answer == "y" || answer == "Y")
}
