//! A handwritten parser for our arguments.
//!
//! We don't use a 3rd party library like clap because we need to parse
//! arguments in the same way as the other linkers on the platform that we're
//! targeting: long options are accepted with a single '-' in addition to the
//! more common double-dash, single-letter options accept joined values
//! (`-lfoo`), and `-as-needed`/`-no-as-needed` toggle state that gets
//! attached to the input files that follow them.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug)]
pub(crate) struct Args {
    pub(crate) output: PathBuf,
    pub(crate) dynamic_linker: Option<PathBuf>,
    pub(crate) export_dynamic: bool,
    pub(crate) entry: String,
    pub(crate) lib_search_path: Vec<PathBuf>,
    pub(crate) inputs: Vec<Input>,
    pub(crate) is_static: bool,
    pub(crate) pie: bool,
    pub(crate) relax: bool,
    pub(crate) filler: Option<u8>,
    pub(crate) sysroot: Option<PathBuf>,
    pub(crate) rpaths: String,
    pub(crate) version_scripts: Vec<PathBuf>,

    /// Symbol names forced into .dynsym, collected from version scripts.
    pub(crate) globals: Vec<String>,

    /// 0 means use all available host parallelism.
    pub(crate) thread_count: usize,
    pub(crate) preload: bool,
    pub(crate) should_fork: bool,
    pub(crate) trace_symbols: Vec<String>,
    pub(crate) stat: bool,
    pub(crate) perf: bool,
    pub(crate) print_map: bool,
    pub(crate) trace: bool,
    pub(crate) z_now: bool,
    pub(crate) discard_all: bool,
    pub(crate) discard_locals: bool,
    pub(crate) strip_all: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Input {
    pub(crate) spec: InputSpec,
    pub(crate) as_needed: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum InputSpec {
    File(PathBuf),
    Lib(String),
}

impl Default for Args {
    fn default() -> Self {
        Self {
            output: PathBuf::new(),
            dynamic_linker: None,
            export_dynamic: false,
            entry: "_start".to_owned(),
            lib_search_path: Vec::new(),
            inputs: Vec::new(),
            is_static: false,
            pie: false,
            relax: true,
            filler: None,
            sysroot: None,
            rpaths: String::new(),
            version_scripts: Vec::new(),
            globals: Vec::new(),
            thread_count: 0,
            preload: false,
            should_fork: true,
            trace_symbols: Vec::new(),
            stat: false,
            perf: false,
            print_map: false,
            trace: false,
            z_now: false,
            discard_all: false,
            discard_locals: false,
            strip_all: false,
        }
    }
}

impl Args {
    pub(crate) fn from_env() -> Result<Args> {
        let tokens = expand_response_files(std::env::args().skip(1))?;
        Args::parse(&tokens)
    }

    pub(crate) fn parse(tokens: &[String]) -> Result<Args> {
        let mut out = Args::default();
        let mut output = None;
        let mut as_needed = false;
        let mut args = tokens;

        while !args.is_empty() {
            if let Some(arg) = read_arg(&mut args, "o")? {
                output = Some(PathBuf::from(arg));
            } else if let Some(arg) = read_arg(&mut args, "dynamic-linker")? {
                out.dynamic_linker = Some(PathBuf::from(arg));
            } else if read_flag(&mut args, "export-dynamic") {
                out.export_dynamic = true;
            } else if let Some(arg) = read_arg(&mut args, "entry")? {
                out.entry = arg.to_owned();
            } else if let Some(arg) = read_arg(&mut args, "e")? {
                out.entry = arg.to_owned();
            } else if read_flag(&mut args, "print-map") {
                out.print_map = true;
            } else if read_flag(&mut args, "stat") {
                out.stat = true;
            } else if read_flag(&mut args, "static") {
                out.is_static = true;
            } else if let Some(arg) = read_arg(&mut args, "trace-symbol")? {
                out.trace_symbols.push(arg.to_owned());
            } else if let Some(arg) = read_arg(&mut args, "y")? {
                out.trace_symbols.push(arg.to_owned());
            } else if let Some(arg) = read_arg(&mut args, "filler")? {
                out.filler = Some(parse_filler(arg)?);
            } else if let Some(arg) = read_arg(&mut args, "library-path")? {
                out.lib_search_path.push(PathBuf::from(arg));
            } else if let Some(arg) = read_arg(&mut args, "L")? {
                out.lib_search_path.push(PathBuf::from(arg));
            } else if let Some(arg) = read_arg(&mut args, "sysroot")? {
                out.sysroot = Some(PathBuf::from(arg));
            } else if read_flag(&mut args, "trace") {
                out.trace = true;
            } else if read_flag(&mut args, "pie") {
                out.pie = true;
            } else if read_flag(&mut args, "no-pie") {
                out.pie = false;
            } else if read_flag(&mut args, "relax") {
                out.relax = true;
            } else if read_flag(&mut args, "no-relax") {
                out.relax = false;
            } else if read_flag(&mut args, "perf") {
                out.perf = true;
            } else if read_z_flag(&mut args, "now") {
                out.z_now = true;
            } else if read_flag(&mut args, "no-fork") {
                out.should_fork = false;
            } else if let Some(arg) = read_arg(&mut args, "thread-count")? {
                out.thread_count = arg
                    .parse()
                    .with_context(|| format!("option -thread-count: not a number: {arg}"))?;
            } else if read_flag(&mut args, "discard-all") || read_flag(&mut args, "x") {
                out.discard_all = true;
            } else if read_flag(&mut args, "discard-locals") || read_flag(&mut args, "X") {
                out.discard_locals = true;
            } else if read_flag(&mut args, "strip-all") || read_flag(&mut args, "s") {
                out.strip_all = true;
            } else if let Some(arg) = read_arg(&mut args, "rpath")? {
                if !out.rpaths.is_empty() {
                    out.rpaths.push(':');
                }
                out.rpaths.push_str(arg);
            } else if let Some(arg) = read_arg(&mut args, "version-script")? {
                out.version_scripts.push(PathBuf::from(arg));
            } else if read_flag(&mut args, "preload") {
                out.preload = true;
            } else if read_flag(&mut args, "as-needed") {
                as_needed = true;
            } else if read_flag(&mut args, "no-as-needed") {
                as_needed = false;
            } else if read_arg(&mut args, "z")?.is_some()
                || read_arg(&mut args, "hash-style")?.is_some()
                || read_arg(&mut args, "m")?.is_some()
                || read_equal(&mut args, "build-id")?.is_some()
            {
                // Accepted and ignored.
            } else if read_flag(&mut args, "eh-frame-hdr")
                || read_flag(&mut args, "start-group")
                || read_flag(&mut args, "end-group")
                || read_flag(&mut args, "fatal-warnings")
                || read_flag(&mut args, "disable-new-dtags")
            {
                // Accepted and ignored.
            } else if let Some(arg) = read_arg(&mut args, "l")? {
                out.inputs.push(Input {
                    spec: InputSpec::Lib(arg.to_owned()),
                    as_needed,
                });
            } else {
                let arg = &args[0];
                if arg.starts_with('-') {
                    bail!("unknown command line option: {arg}");
                }
                out.inputs.push(Input {
                    spec: InputSpec::File(PathBuf::from(arg)),
                    as_needed,
                });
                args = &args[1..];
            }
        }

        let Some(output) = output else {
            bail!("-o option is missing");
        };
        out.output = output;

        for path in out.version_scripts.clone() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read version script `{}`", path.display()))?;
            out.globals.extend(parse_version_script(&contents));
        }

        Ok(out)
    }

    pub(crate) fn image_base(&self) -> u64 {
        if self.pie {
            0
        } else {
            crate::elf::NON_PIE_START_MEM_ADDRESS
        }
    }

    pub(crate) fn setup_thread_pool(&self) -> Result {
        // The pool might already be initialised when we're called from tests,
        // suppress the error intentionally.
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_count)
            .build_global();
        Ok(())
    }

    /// Searches the library path for `-lNAME`, honouring `-static` and
    /// prefixing absolute search directories with the sysroot.
    pub(crate) fn find_library(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.lib_search_path {
            let dir = self.apply_sysroot(dir);
            if !self.is_static {
                let so = dir.join(format!("lib{name}.so"));
                if so.exists() {
                    return Ok(so);
                }
            }
            let a = dir.join(format!("lib{name}.a"));
            if a.exists() {
                return Ok(a);
            }
        }
        bail!("library not found: {name}");
    }

    fn apply_sysroot(&self, dir: &Path) -> PathBuf {
        match (&self.sysroot, dir.is_absolute()) {
            (Some(sysroot), true) => {
                sysroot.join(dir.strip_prefix("/").unwrap_or(dir))
            }
            _ => dir.to_owned(),
        }
    }
}

/// Reads an option that takes a value. Single-letter names accept the joined
/// form (`-lfoo`); longer names accept `-name value`, `--name value`,
/// `-name=value` and `--name=value`.
fn read_arg<'a>(args: &mut &'a [String], name: &str) -> Result<Option<&'a str>> {
    let first = &args[0];
    if name.len() == 1 {
        let dashed = format!("-{name}");
        if *first == dashed {
            if args.len() == 1 {
                bail!("option -{name}: argument missing");
            }
            let value = &args[1];
            *args = &args[2..];
            return Ok(Some(value));
        }
        if let Some(rest) = first.strip_prefix(&dashed) {
            *args = &args[1..];
            return Ok(Some(rest));
        }
        return Ok(None);
    }
    for opt in [format!("-{name}"), format!("--{name}")] {
        if *first == opt {
            if args.len() == 1 {
                bail!("option -{name}: argument missing");
            }
            let value = &args[1];
            *args = &args[2..];
            return Ok(Some(value));
        }
        if let Some(rest) = first.strip_prefix(&opt) {
            if let Some(value) = rest.strip_prefix('=') {
                *args = &args[1..];
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

fn read_flag(args: &mut &[String], name: &str) -> bool {
    let first = &args[0];
    if *first == format!("-{name}") || *first == format!("--{name}") {
        *args = &args[1..];
        return true;
    }
    false
}

fn read_z_flag(args: &mut &[String], name: &str) -> bool {
    if args.len() >= 2 && args[0] == "-z" && args[1] == name {
        *args = &args[2..];
        return true;
    }
    if args[0] == format!("-z{name}") {
        *args = &args[1..];
        return true;
    }
    false
}

/// Reads a flag that optionally takes `=value`. Returns the value, or "" for
/// the bare form.
fn read_equal<'a>(args: &mut &'a [String], name: &str) -> Result<Option<&'a str>> {
    let first = &args[0];
    for opt in [format!("-{name}"), format!("--{name}")] {
        if *first == opt {
            *args = &args[1..];
            return Ok(Some(""));
        }
        if let Some(rest) = first.strip_prefix(&opt) {
            if let Some(value) = rest.strip_prefix('=') {
                *args = &args[1..];
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

fn parse_filler(value: &str) -> Result<u8> {
    let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) else {
        bail!("option -filler: not a hexadecimal number: {value}");
    };
    let n = u64::from_str_radix(hex, 16)
        .with_context(|| format!("option -filler: not a hexadecimal number: {value}"))?;
    if n > 0xff {
        bail!("option -filler: value out of range: {value}");
    }
    Ok(n as u8)
}

/// Expands `@path` tokens in place with the whitespace-separated arguments
/// found in the named file.
pub(crate) fn expand_response_files(raw: impl Iterator<Item = String>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for token in raw {
        if let Some(path) = token.strip_prefix('@') {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read response file `{path}`"))?;
            out.extend(arguments_from_string(&contents)?);
        } else {
            out.push(token);
        }
    }
    Ok(out)
}

/// Parses arguments from a string, handling single and double quotes with
/// backslash escapes inside them.
fn arguments_from_string(input: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut buf = String::new();
        if first == '\'' || first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    None => bail!("premature end of input in quoted argument"),
                    Some(ch) if ch == first => break,
                    Some('\\') => {
                        let Some(escaped) = chars.next() else {
                            bail!("premature end of input after backslash");
                        };
                        buf.push(escaped);
                    }
                    Some(ch) => buf.push(ch),
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                buf.push(ch);
                chars.next();
            }
        }
        out.push(buf);
    }
    Ok(out)
}

/// Extracts the names listed in the `global:` block(s) of a version script.
/// We don't implement versioned nodes; every named global is exported.
fn parse_version_script(contents: &str) -> Vec<String> {
    let mut globals = Vec::new();
    let mut in_global = false;
    let without_comments = strip_comments(contents);
    for raw in without_comments.split([';', '{', '}', '\n']) {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        if token.eq_ignore_ascii_case("global:") {
            in_global = true;
        } else if token.eq_ignore_ascii_case("local:") || token.ends_with(':') {
            in_global = false;
        } else if in_global && token != "*" {
            globals.push(token.to_owned());
        }
    }
    globals
}

fn strip_comments(contents: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    let mut rest = contents;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start..].find("*/") {
            Some(end) => rest = &rest[start + end + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_basic_options() {
        let args = Args::parse(&strings(&[
            "-o", "out", "main.o", "-L/usr/lib", "-lc", "-static", "-e", "begin",
        ]))
        .unwrap();
        assert_eq!(args.output, PathBuf::from("out"));
        assert!(args.is_static);
        assert_eq!(args.entry, "begin");
        assert_eq!(args.lib_search_path, [PathBuf::from("/usr/lib")]);
        assert_eq!(args.inputs.len(), 2);
        assert!(matches!(&args.inputs[1].spec, InputSpec::Lib(l) if l == "c"));
    }

    #[test]
    fn test_as_needed_applies_to_following_inputs() {
        let args =
            Args::parse(&strings(&["-o", "out", "-lc", "-as-needed", "-lm", "-no-as-needed", "-lx"]))
                .unwrap();
        assert!(!args.inputs[0].as_needed);
        assert!(args.inputs[1].as_needed);
        assert!(!args.inputs[2].as_needed);
    }

    #[test]
    fn test_double_dash_and_equals() {
        let args = Args::parse(&strings(&["--entry=main", "-o", "out"])).unwrap();
        assert_eq!(args.entry, "main");
    }

    #[test]
    fn test_filler() {
        let args = Args::parse(&strings(&["-o", "out", "-filler", "0xfe"])).unwrap();
        assert_eq!(args.filler, Some(0xfe));
        assert!(Args::parse(&strings(&["-o", "out", "-filler", "255"])).is_err());
    }

    #[test]
    fn test_unknown_option_is_fatal() {
        assert!(Args::parse(&strings(&["-o", "out", "-bogus-flag"])).is_err());
    }

    #[test]
    fn test_missing_output_is_fatal() {
        assert!(Args::parse(&strings(&["main.o"])).is_err());
    }

    #[test]
    fn test_rpath_accumulates() {
        let args =
            Args::parse(&strings(&["-o", "out", "-rpath", "/a", "-rpath", "/b"])).unwrap();
        assert_eq!(args.rpaths, "/a:/b");
    }

    #[test]
    fn test_z_now() {
        let args = Args::parse(&strings(&["-o", "out", "-z", "now"])).unwrap();
        assert!(args.z_now);
        let args = Args::parse(&strings(&["-o", "out", "-znow"])).unwrap();
        assert!(args.z_now);
    }

    #[test]
    fn test_arguments_from_string() {
        assert_eq!(
            arguments_from_string(r#"a 'b c' "d\"e"  f"#).unwrap(),
            ["a", "b c", "d\"e", "f"]
        );
        assert!(arguments_from_string("'unterminated").is_err());
    }

    #[test]
    fn test_version_script() {
        let globals = parse_version_script(
            "/* comment */ { global: foo; bar; local: *; };",
        );
        assert_eq!(globals, ["foo", "bar"]);
    }
}
