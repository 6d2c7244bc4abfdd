//! WGSL compilation: preprocessing, validation, reflection and the on-disk shader cache.
//!
//! A [`CompiledShader`] is the crate's equivalent of shader bytecode: the preprocessed
//! source of one entry point plus its [`ShaderReflection`]. The [`ShaderCompiler`] can keep
//! compiled shaders in a cache directory as `<name>.json`; a cached entry is trusted until
//! the directory is deleted or the compiler runs with `force_write`.
//!
//! # Preprocessor
//!
//! Lines whose first non-blank character is `#` are directives:
//!
//! ```text
//! #ifdef USE_IBL        // defined
//! #ifndef USE_IBL       // not defined
//! #if BLEND_CASCADES    // defined and not "0"
//! #if !BLEND_CASCADES   // negation of the above
//! #else
//! #endif
//! ```
//!
//! Directive lines and inactive lines are replaced by empty lines so diagnostics keep
//! their original line numbers.

use super::reflection::{ShaderReflection, reflect};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A validated, reflected WGSL entry point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledShader {
    /// Name the shader is registered and cached under.
    pub name: String,
    /// Preprocessed WGSL.
    pub source: String,
    pub reflection: ShaderReflection,
}

impl CompiledShader {
    pub fn entry_point(&self) -> &str {
        &self.reflection.entry_point
    }
}

/// Compiles WGSL entry points, optionally through a cache directory.
#[derive(Clone, Debug, Default)]
pub struct ShaderCompiler {
    cache_dir: Option<PathBuf>,
    force_write: bool,
}

impl ShaderCompiler {
    /// A compiler without a cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A compiler that reads and writes `<dir>/<name>.json`.
    ///
    /// With `force_write`, cached entries are ignored and overwritten.
    pub fn with_cache(dir: impl Into<PathBuf>, force_write: bool) -> Self {
        Self {
            cache_dir: Some(dir.into()),
            force_write,
        }
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Compiles `entry_point` from `source` with the given preprocessor defines.
    pub fn compile(
        &self,
        name: &str,
        source: &str,
        entry_point: &str,
        defines: &[(&str, &str)],
    ) -> Result<CompiledShader, EngineError> {
        let cache_path = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", name)));

        if let Some(path) = &cache_path {
            if !self.force_write && path.exists() {
                match load_cached(path) {
                    Ok(shader) => {
                        log::info!("Shader '{}' loaded from cache", name);
                        return Ok(shader);
                    }
                    Err(e) => log::warn!("Ignoring shader cache entry {}: {}", path.display(), e),
                }
            }
        }

        let shader = compile_source(name, source, entry_point, defines)?;

        if let Some(path) = &cache_path {
            match store_cached(path, &shader) {
                Ok(()) => log::debug!("Shader '{}' written to {}", name, path.display()),
                Err(e) => log::warn!("Could not cache shader '{}' at {}: {}", name, path.display(), e),
            }
        }

        Ok(shader)
    }
}

fn store_cached(path: &Path, shader: &CompiledShader) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec(shader)?)?;
    Ok(())
}

fn load_cached(path: &Path) -> Result<CompiledShader, EngineError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Preprocesses, parses, validates and reflects one entry point.
pub fn compile_source(
    name: &str,
    source: &str,
    entry_point: &str,
    defines: &[(&str, &str)],
) -> Result<CompiledShader, EngineError> {
    let source = preprocess(name, source, defines)?;

    let module = naga::front::wgsl::parse_str(&source).map_err(|e| EngineError::ShaderParse {
        name: name.to_string(),
        message: e.emit_to_string(&source),
    })?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| EngineError::ShaderValidation {
        name: name.to_string(),
        message: e.to_string(),
    })?;

    let reflection = reflect(name, &module, &info, entry_point)?;

    Ok(CompiledShader {
        name: name.to_string(),
        source,
        reflection,
    })
}

/// Resolves `#ifdef`/`#ifndef`/`#if`/`#else`/`#endif` against `defines`.
pub fn preprocess(
    name: &str,
    source: &str,
    defines: &[(&str, &str)],
) -> Result<String, EngineError> {
    let defines: HashMap<&str, &str> = defines.iter().copied().collect();
    let is_true = |symbol: &str| defines.get(symbol).is_some_and(|v| v.trim() != "0");

    struct Frame {
        parent_active: bool,
        condition: bool,
        seen_else: bool,
    }

    let error = |line: usize, message: &str| EngineError::ShaderParse {
        name: name.to_string(),
        message: format!("line {}: {}", line + 1, message),
    };

    let mut stack: Vec<Frame> = Vec::new();
    let mut active = true;
    let mut out = String::with_capacity(source.len());

    for (line_no, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(directive) = trimmed.strip_prefix('#') {
            let mut parts = directive.split_whitespace();
            let keyword = parts.next().unwrap_or("");
            let argument = parts.next();

            match keyword {
                "ifdef" | "ifndef" | "if" => {
                    let symbol = argument.ok_or_else(|| error(line_no, "missing symbol"))?;
                    let condition = match keyword {
                        "ifdef" => defines.contains_key(symbol),
                        "ifndef" => !defines.contains_key(symbol),
                        _ => match symbol.strip_prefix('!') {
                            Some(negated) => !is_true(negated),
                            None => is_true(symbol),
                        },
                    };
                    stack.push(Frame {
                        parent_active: active,
                        condition,
                        seen_else: false,
                    });
                    active = active && condition;
                }
                "else" => {
                    let frame = stack
                        .last_mut()
                        .ok_or_else(|| error(line_no, "#else without #if"))?;
                    if frame.seen_else {
                        return Err(error(line_no, "duplicate #else"));
                    }
                    frame.seen_else = true;
                    active = frame.parent_active && !frame.condition;
                }
                "endif" => {
                    let frame = stack
                        .pop()
                        .ok_or_else(|| error(line_no, "#endif without #if"))?;
                    active = frame.parent_active;
                }
                other => {
                    return Err(error(line_no, &format!("unknown directive #{}", other)));
                }
            }
            out.push('\n');
            continue;
        }

        if active {
            out.push_str(line);
        }
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(error(source.lines().count(), "unterminated #if"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "a\n#ifdef FOO\nb\n#else\nc\n#endif\n#if !BAR\nd\n#endif\n";

    #[test]
    fn preprocess_branches() {
        let none = preprocess("t", SRC, &[]).unwrap();
        assert_eq!(none.lines().collect::<Vec<_>>(), ["a", "", "", "", "c", "", "", "d", ""]);

        let both = preprocess("t", SRC, &[("FOO", "1"), ("BAR", "1")]).unwrap();
        let kept: Vec<_> = both.lines().filter(|l| !l.is_empty()).collect();
        assert_eq!(kept, ["a", "b"]);

        let zero = preprocess("t", SRC, &[("BAR", "0")]).unwrap();
        assert!(zero.lines().any(|l| l == "d"));
    }

    #[test]
    fn nested_inactive_blocks_stay_inactive() {
        let src = "#ifdef A\n#ifndef B\nx\n#else\ny\n#endif\n#endif\n";
        let out = preprocess("t", src, &[("B", "1")]).unwrap();
        assert!(out.lines().all(|l| l.is_empty()));
    }

    #[test]
    fn unbalanced_directives_fail() {
        assert!(preprocess("t", "#ifdef A\n", &[]).is_err());
        assert!(preprocess("t", "#endif\n", &[]).is_err());
        assert!(preprocess("t", "#ifdef A\n#else\n#else\n#endif\n", &[]).is_err());
    }

    const SHADER: &str = r#"
        struct Params { color: vec4<f32>,
        #ifdef EXTRA
            extra: vec4<f32>,
        #endif
        }
        @group(0) @binding(0) var<uniform> params: Params;
        @fragment fn fs() -> @location(0) vec4<f32> { return params.color; }
    "#;

    #[test]
    fn defines_change_reflected_size() {
        let small = compile_source("small", SHADER, "fs", &[]).unwrap();
        let large = compile_source("large", SHADER, "fs", &[("EXTRA", "1")]).unwrap();
        let size = |s: &CompiledShader| match &s.reflection.bindings[0].kind {
            crate::effect::reflection::BindingKind::UniformBuffer { size, .. } => *size,
            _ => 0,
        };
        assert_eq!(size(&small), 16);
        assert_eq!(size(&large), 32);
    }

    #[test]
    fn parse_errors_are_reported() {
        let result = compile_source("bad", "fn broken( {", "fs", &[]);
        assert!(matches!(result, Err(EngineError::ShaderParse { .. })));
    }

    #[test]
    fn cache_is_used_until_forced() {
        let dir = std::env::temp_dir().join(format!("umbra-shader-cache-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let compiler = ShaderCompiler::with_cache(&dir, false);
        let first = compiler.compile("cached_fs", SHADER, "fs", &[]).unwrap();
        assert!(dir.join("cached_fs.json").exists());

        // The cached entry wins even though the defines changed.
        let second = compiler
            .compile("cached_fs", SHADER, "fs", &[("EXTRA", "1")])
            .unwrap();
        assert_eq!(first, second);

        let forced = ShaderCompiler::with_cache(&dir, true)
            .compile("cached_fs", SHADER, "fs", &[("EXTRA", "1")])
            .unwrap();
        assert_ne!(first, forced);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unwritable_cache_still_compiles() {
        // A regular file where the cache directory should be makes every write fail.
        let blocker = std::env::temp_dir().join(format!("umbra-cache-blocker-{}", std::process::id()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let compiler = ShaderCompiler::with_cache(blocker.join("cache"), false);
        let shader = compiler.compile("uncached_fs", SHADER, "fs", &[]).unwrap();
        assert_eq!(shader, compile_source("uncached_fs", SHADER, "fs", &[]).unwrap());
        assert!(!blocker.join("cache").exists());

        let _ = std::fs::remove_file(&blocker);
    }
}
