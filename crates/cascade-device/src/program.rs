//! Program compilation and the kernel cache.
//!
//! Programs are built from kernel source text the way an OpenCL driver would
//! build them, and memoized per (context, source, options). The host device
//! "compiles" by checking the text and binding every `__kernel` entry point to
//! a native implementation for the program's `scalar_t` element type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cascade_core::{CascadeError, DType, Result};
use parking_lot::Mutex;

use crate::device::ContextId;
use crate::host::{self, HostKernelFn};

/// A callable kernel entry point.
#[derive(Clone)]
pub struct Kernel {
    program: Arc<str>,
    name: Arc<str>,
    entry: HostKernelFn,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_name(&self) -> &str {
        &self.program
    }

    pub(crate) fn entry(&self) -> HostKernelFn {
        self.entry
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kernel({}::{})", self.program, self.name)
    }
}

/// A compiled program: a set of named kernels for one element type.
pub struct Program {
    name: Arc<str>,
    options: String,
    dtype: DType,
    entries: Vec<String>,
    kernels: HashMap<String, HostKernelFn>,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    /// Element type bound to `scalar_t` in the source.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Kernel entry points in source order.
    pub fn entry_names(&self) -> &[String] {
        &self.entries
    }

    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        let entry = self
            .kernels
            .get(name)
            .copied()
            .ok_or_else(|| CascadeError::KernelNotFound {
                program: self.name.to_string(),
                kernel: name.to_string(),
            })?;
        Ok(Kernel {
            program: Arc::clone(&self.name),
            name: Arc::from(name),
            entry,
        })
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("dtype", &self.dtype)
            .field("entries", &self.entries)
            .finish()
    }
}

// ============================================================================
// Compilation
// ============================================================================

struct BuildLog {
    lines: Vec<String>,
}

impl BuildLog {
    fn error(&mut self, line: usize, msg: impl fmt::Display) {
        self.lines.push(format!("line {}: error: {}", line, msg));
    }
}

fn check_options(options: &str, log: &mut BuildLog) {
    for opt in options.split_whitespace() {
        let ok = match opt {
            "-w" | "-Werror" => true,
            _ if opt.starts_with("-D") => opt.len() > 2 && !opt[2..].starts_with('='),
            _ if opt.starts_with("-cl-") => opt.len() > 4,
            _ => false,
        };
        if !ok {
            log.lines.push(format!("error: invalid build option '{}'", opt));
        }
    }
}

/// Remove comments, keeping newlines so line numbers stay accurate.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn check_balance(source: &str, log: &mut BuildLog) {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (lineno, line) in source.lines().enumerate() {
        for c in line.chars() {
            match c {
                '{' | '(' | '[' => stack.push((c, lineno + 1)),
                '}' | ')' | ']' => {
                    let open = match c {
                        '}' => '{',
                        ')' => '(',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((o, _)) if o == open => {}
                        _ => {
                            log.error(lineno + 1, format!("unmatched '{}'", c));
                            return;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if let Some((c, line)) = stack.pop() {
        log.error(line, format!("'{}' is never closed", c));
    }
}

/// Element type named by `typedef <type> scalar_t;`.
fn scalar_type(source: &str, log: &mut BuildLog) -> Option<DType> {
    for (lineno, line) in source.lines().enumerate() {
        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ';')
            .filter(|t| !t.is_empty())
            .collect();
        if let ["typedef", ty, "scalar_t"] = tokens.as_slice() {
            let found = DType::ALL.into_iter().find(|d| d.kernel_type_name() == *ty);
            if found.is_none() {
                log.error(lineno + 1, format!("unknown scalar type '{}'", ty));
            }
            return found;
        }
    }
    log.lines.push("error: scalar_t is not defined".into());
    None
}

/// `(line, name)` for every `__kernel void name(` in the source.
fn kernel_entries(source: &str) -> Vec<(usize, String)> {
    let mut entries = Vec::new();
    for (lineno, line) in source.lines().enumerate() {
        let mut rest = line;
        while let Some(pos) = rest.find("__kernel") {
            rest = &rest[pos + "__kernel".len()..];
            let after = rest.trim_start();
            let Some(after) = after.strip_prefix("void") else {
                continue;
            };
            let name: String = after
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                entries.push((lineno + 1, name));
            }
        }
    }
    entries
}

pub(crate) fn compile(name: &str, source: &str, options: &str) -> Result<Program> {
    let mut log = BuildLog { lines: Vec::new() };
    check_options(options, &mut log);

    let source = strip_comments(source);
    check_balance(&source, &mut log);
    let dtype = scalar_type(&source, &mut log);

    let entries = kernel_entries(&source);
    if entries.is_empty() {
        log.lines.push("error: no __kernel entry points".into());
    }

    let mut kernels = HashMap::new();
    if let Some(dtype) = dtype {
        for (line, entry) in &entries {
            match host::lookup(entry, dtype) {
                Some(f) => {
                    if kernels.insert(entry.clone(), f).is_some() {
                        log.error(*line, format!("redefinition of kernel '{}'", entry));
                    }
                }
                None => log.error(
                    *line,
                    format!("kernel '{}' has no implementation for {}", entry, dtype),
                ),
            }
        }
    }

    match dtype {
        Some(dtype) if log.lines.is_empty() => Ok(Program {
            name: Arc::from(name),
            options: options.to_string(),
            dtype,
            entries: entries.into_iter().map(|(_, n)| n).collect(),
            kernels,
        }),
        _ => Err(CascadeError::Compilation {
            program: name.to_string(),
            log: log.lines.join("\n"),
        }),
    }
}

// ============================================================================
// KernelCache
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Hash, PartialEq, Eq)]
struct ProgramKey {
    context: ContextId,
    source: String,
    options: String,
}

struct CacheInner {
    programs: HashMap<ProgramKey, Arc<Program>>,
    hits: u64,
    misses: u64,
}

/// Compiled programs keyed by (context, source text, options).
///
/// A failed build is not cached; asking again rebuilds and fails again.
pub struct KernelCache {
    inner: Mutex<CacheInner>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                programs: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get_program(
        &self,
        context: ContextId,
        name: &str,
        source: &str,
        options: &str,
    ) -> Result<Arc<Program>> {
        let key = ProgramKey {
            context,
            source: source.to_string(),
            options: options.to_string(),
        };
        {
            let mut inner = self.inner.lock();
            if let Some(program) = inner.programs.get(&key).cloned() {
                inner.hits += 1;
                return Ok(program);
            }
            inner.misses += 1;
        }

        tracing::debug!("building program '{}' for context {:?}", name, context);
        let program = Arc::new(compile(name, source, options)?);

        let mut inner = self.inner.lock();
        Ok(Arc::clone(inner.programs.entry(key).or_insert(program)))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().programs.clear();
    }
}

impl Default for KernelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("KernelCache")
            .field("programs", &inner.programs.len())
            .field("hits", &inner.hits)
            .field("misses", &inner.misses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
        typedef float scalar_t;
        // scale every element
        __kernel void scale(__global const scalar_t* in, __global scalar_t* out,
                            double factor, ulong size) {
            size_t i = get_global_id(0);
            if (i < size) { out[i] = in[i] * factor; }
        }
        /* __kernel void ignored( */
        __kernel void negate(__global const scalar_t* in, __global scalar_t* out, ulong size) {
            size_t i = get_global_id(0);
            if (i < size) { out[i] = -in[i]; }
        }
    "#;

    fn ctx(n: u64) -> ContextId {
        ContextId::from_raw(n)
    }

    #[test]
    fn test_compile_entries() {
        let p = compile("transform", SOURCE, "-cl-fast-relaxed-math -DN=4").unwrap();
        assert_eq!(p.dtype(), DType::F32);
        assert_eq!(p.entry_names(), &["scale".to_string(), "negate".to_string()]);
        assert_eq!(p.kernel("negate").unwrap().name(), "negate");
        assert!(matches!(
            p.kernel("ignored"),
            Err(CascadeError::KernelNotFound { .. })
        ));
    }

    #[test]
    fn test_compile_errors_carry_log() {
        let err = compile("broken", "typedef float scalar_t;\n__kernel void scale( {", "").unwrap_err();
        match err {
            CascadeError::Compilation { program, log } => {
                assert_eq!(program, "broken");
                assert!(log.contains("never closed"), "{}", log);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = compile("opts", SOURCE, "-O3").unwrap_err();
        assert!(err.to_string().contains("invalid build option '-O3'"));

        let err = compile("untyped", "__kernel void scale() {}", "").unwrap_err();
        assert!(err.to_string().contains("scalar_t is not defined"));

        let err = compile("unknown", "typedef int scalar_t;\n__kernel void mystery() {}", "")
            .unwrap_err();
        assert!(err.to_string().contains("mystery"));

        let err = compile("empty", "typedef int scalar_t;", "").unwrap_err();
        assert!(err.to_string().contains("no __kernel"));
    }

    #[test]
    fn test_cache_hits_per_context() {
        let cache = KernelCache::new();
        let a = cache.get_program(ctx(1), "transform", SOURCE, "").unwrap();
        let b = cache.get_program(ctx(1), "transform", SOURCE, "").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });

        let c = cache.get_program(ctx(2), "transform", SOURCE, "").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        let _ = cache.get_program(ctx(1), "transform", SOURCE, "-w").unwrap();
        assert_eq!(cache.len(), 3);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failures_not_cached() {
        let cache = KernelCache::new();
        assert!(cache.get_program(ctx(1), "bad", "}", "").is_err());
        assert!(cache.get_program(ctx(1), "bad", "}", "").is_err());
        assert_eq!(cache.stats().misses, 2);
        assert!(cache.is_empty());
    }
}
