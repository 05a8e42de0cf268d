//! Resolving and compiling skill packages.
//!
//! A skill package is a directory under the skills root containing
//! `index.rhai` (or `main.rhai`) that defines `fn execute(params)` or
//! `fn main(params)`.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use rhai::{AST, Engine};

use super::error::SkillError;

/// Entry files, in lookup order.
pub const ENTRY_FILES: [&str; 2] = ["index.rhai", "main.rhai"];

/// Entry functions, in lookup order.
pub const ENTRY_FUNCTIONS: [&str; 2] = ["execute", "main"];

/// A skill located on disk but not loaded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillPackage {
    pub name: String,
    pub dir: PathBuf,
    pub entry_file: PathBuf,
}

impl SkillPackage {
    /// Find `name` under `root`. Only a single plain path component is a valid name.
    pub fn resolve(root: &Path, name: &str) -> Result<Self, SkillError> {
        let dir = root.join(name);
        let not_found = |path: PathBuf| SkillError::NotFound {
            name: name.to_string(),
            path,
        };

        let mut components = Path::new(name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(c)), None) if c == name
        );
        if !plain || !dir.is_dir() {
            return Err(not_found(dir));
        }

        ENTRY_FILES
            .iter()
            .map(|file| dir.join(file))
            .find(|path| path.is_file())
            .map(|entry_file| Self {
                name: name.to_string(),
                dir: dir.clone(),
                entry_file,
            })
            .ok_or_else(|| not_found(dir.join(ENTRY_FILES[0])))
    }
}

/// Which function to call and whether it takes the params map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: &'static str,
    pub takes_params: bool,
}

/// A compiled skill.
#[derive(Debug, Clone)]
pub struct LoadedSkill {
    pub name: String,
    pub entry_file: PathBuf,
    pub ast: AST,
}

impl LoadedSkill {
    pub fn new(name: impl Into<String>, entry_file: PathBuf, ast: AST) -> Self {
        Self {
            name: name.into(),
            entry_file,
            ast,
        }
    }

    /// `execute` wins over `main`; a one-argument form wins over a nullary one.
    pub fn entry_point(&self) -> Option<EntryPoint> {
        ENTRY_FUNCTIONS.iter().find_map(|&name| {
            let arities: Vec<usize> = self
                .ast
                .iter_functions()
                .filter(|f| f.name == name)
                .map(|f| f.params.len())
                .collect();
            if arities.contains(&1) {
                Some(EntryPoint {
                    name,
                    takes_params: true,
                })
            } else if arities.contains(&0) {
                Some(EntryPoint {
                    name,
                    takes_params: false,
                })
            } else {
                None
            }
        })
    }
}

/// Turns a resolved package into a loaded skill.
pub trait SkillLoader: Send + Sync {
    fn load(&self, package: &SkillPackage) -> anyhow::Result<LoadedSkill>;
}

/// Reads the entry file and compiles it with Rhai.
pub struct RhaiSkillLoader {
    engine: Engine,
}

impl RhaiSkillLoader {
    pub fn new() -> Self {
        Self {
            engine: Engine::new(),
        }
    }
}

impl Default for RhaiSkillLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillLoader for RhaiSkillLoader {
    fn load(&self, package: &SkillPackage) -> anyhow::Result<LoadedSkill> {
        let source = std::fs::read_to_string(&package.entry_file)
            .with_context(|| format!("reading {}", package.entry_file.display()))?;
        let ast = self
            .engine
            .compile(&source)
            .map_err(|e| anyhow::anyhow!("{}: {}", package.entry_file.display(), e))?;
        Ok(LoadedSkill::new(&package.name, package.entry_file.clone(), ast))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn skill_dir(files: &[(&str, &str)]) -> TempDir {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("greet");
        fs::create_dir(&dir).unwrap();
        for (file, body) in files {
            fs::write(dir.join(file), body).unwrap();
        }
        root
    }

    #[test]
    fn test_resolve_prefers_index() {
        let root = skill_dir(&[("index.rhai", ""), ("main.rhai", "")]);
        let pkg = SkillPackage::resolve(root.path(), "greet").unwrap();
        assert!(pkg.entry_file.ends_with("index.rhai"));
    }

    #[test]
    fn test_resolve_falls_back_to_main() {
        let root = skill_dir(&[("main.rhai", "")]);
        let pkg = SkillPackage::resolve(root.path(), "greet").unwrap();
        assert!(pkg.entry_file.ends_with("main.rhai"));
    }

    #[test]
    fn test_resolve_missing() {
        let root = skill_dir(&[("README.md", "")]);
        assert!(matches!(
            SkillPackage::resolve(root.path(), "greet"),
            Err(SkillError::NotFound { .. })
        ));
        assert!(matches!(
            SkillPackage::resolve(root.path(), "absent"),
            Err(SkillError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_paths() {
        let root = skill_dir(&[("index.rhai", "")]);
        for name in ["../greet", "greet/..", "/greet", "", "."] {
            assert!(
                matches!(
                    SkillPackage::resolve(root.path(), name),
                    Err(SkillError::NotFound { .. })
                ),
                "{name:?} should not resolve"
            );
        }
    }

    fn compiled(source: &str) -> LoadedSkill {
        let ast = Engine::new().compile(source).unwrap();
        LoadedSkill::new("t", PathBuf::from("t/index.rhai"), ast)
    }

    #[test]
    fn test_entry_point_selection() {
        let skill = compiled("fn main(p) { 1 } fn execute(p) { 2 }");
        assert_eq!(
            skill.entry_point(),
            Some(EntryPoint {
                name: "execute",
                takes_params: true
            })
        );

        let skill = compiled("fn main() { 1 }");
        assert_eq!(
            skill.entry_point(),
            Some(EntryPoint {
                name: "main",
                takes_params: false
            })
        );

        assert_eq!(compiled("fn helper(a, b) { a }").entry_point(), None);
        assert_eq!(compiled("fn execute(a, b) { a }").entry_point(), None);
    }

    #[test]
    fn test_rhai_loader_reports_syntax_errors() {
        let root = skill_dir(&[("index.rhai", "fn execute(p) { let = }")]);
        let pkg = SkillPackage::resolve(root.path(), "greet").unwrap();
        let err = RhaiSkillLoader::new().load(&pkg).unwrap_err();
        assert!(err.to_string().contains("index.rhai"));
    }
}
