//! eBPF program loader
//!
//! [`AyaLinker`] is the aya-backed [`KernelLinker`]: it loads a prebuilt
//! BPF object, then installs and removes the kprobe program on the
//! requested kernel functions.

use crate::attach::{KernelLinker, LinkId, LinkerError};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    programs::{kprobe::KProbeLinkId, KProbe},
    Bpf,
};
use aya_log::BpfLogger;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    error::Error as StdError,
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

struct LinkerState {
    // Loaded on first install so privilege problems surface from attach.
    bpf: Option<Bpf>,
    program_loaded: bool,
    links: HashMap<LinkId, KProbeLinkId>,
    next_link: LinkId,
}

/// Kprobe linker backed by an aya `Bpf` object
pub struct AyaLinker {
    object_path: PathBuf,
    object: Vec<u8>,
    program: String,
    state: Mutex<LinkerState>,
}

impl AyaLinker {
    /// Read the BPF object file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the compiled BPF object
    /// * `program` - Name of the kprobe program inside the object
    pub fn new(path: &Path, program: &str) -> Result<Self> {
        info!("Reading eBPF object from: {:?}", path);
        let object = std::fs::read(path)
            .with_context(|| format!("Failed to read eBPF object file: {:?}", path))?;

        Ok(Self {
            object_path: path.to_path_buf(),
            object,
            program: program.to_string(),
            state: Mutex::new(LinkerState {
                bpf: None,
                program_loaded: false,
                links: HashMap::new(),
                next_link: 0,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, LinkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the perf event array the kprobe program writes records to
    ///
    /// Only available after a successful install.
    pub fn take_perf_array(&self, map_name: &str) -> Result<AsyncPerfEventArray<MapData>> {
        let mut state = self.state();
        let bpf = state
            .bpf
            .as_mut()
            .context("eBPF object not loaded; attach a probe first")?;
        let map = bpf
            .take_map(map_name)
            .with_context(|| format!("{} map not found in eBPF object", map_name))?;

        AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("Failed to create AsyncPerfEventArray from {} map", map_name))
    }

    fn load_object(&self, symbol: &str) -> Result<Bpf, LinkerError> {
        ensure_privileged()?;

        info!("Loading eBPF program from {:?}...", self.object_path);
        let mut bpf = Bpf::load(&self.object)
            .map_err(|e| classify(symbol, "Failed to load eBPF object", e, false))?;

        // Kernel-side logging is optional; objects built without aya-log have no log map.
        if let Err(e) = BpfLogger::init(&mut bpf) {
            warn!("eBPF logger not initialised: {}", e);
        }

        info!("eBPF program loaded successfully");
        Ok(bpf)
    }
}

impl KernelLinker for AyaLinker {
    fn install(&self, target_symbol: &str) -> Result<LinkId, LinkerError> {
        if matches!(kallsyms_contains(target_symbol), Ok(false)) {
            return Err(LinkerError::SymbolNotFound(target_symbol.to_string()));
        }

        let mut state = self.state();
        if state.bpf.is_none() {
            state.bpf = Some(self.load_object(target_symbol)?);
        }

        let LinkerState {
            bpf,
            program_loaded,
            links,
            next_link,
        } = &mut *state;
        let program = kprobe_program(bpf.as_mut(), &self.program, target_symbol)?;

        if !*program_loaded {
            program
                .load()
                .map_err(|e| classify(target_symbol, "Failed to load kprobe program", e, false))?;
            *program_loaded = true;
        }

        let kprobe_link = program.attach(target_symbol, 0).map_err(|e| {
            classify(
                target_symbol,
                &format!("Failed to attach {} kprobe", target_symbol),
                e,
                true,
            )
        })?;

        let link = *next_link;
        *next_link += 1;
        links.insert(link, kprobe_link);
        info!("  ✓ Attached {} to {}", self.program, target_symbol);

        Ok(link)
    }

    fn uninstall(&self, link: LinkId) -> Result<(), LinkerError> {
        let mut state = self.state();
        let kprobe_link = state
            .links
            .remove(&link)
            .ok_or(LinkerError::UnknownLink(link))?;

        let program = kprobe_program(state.bpf.as_mut(), &self.program, "")?;
        program
            .detach(kprobe_link)
            .map_err(|e| classify("", "Failed to detach kprobe", e, false))?;
        debug!("Detached link {}", link);

        Ok(())
    }
}

fn kprobe_program<'a>(
    bpf: Option<&'a mut Bpf>,
    name: &str,
    symbol: &str,
) -> Result<&'a mut KProbe, LinkerError> {
    let bpf = bpf.ok_or_else(|| LinkerError::Other {
        context: "eBPF object not loaded".to_string(),
        source: Box::new(io::Error::from(io::ErrorKind::NotConnected)),
    })?;
    let program = bpf.program_mut(name).ok_or_else(|| LinkerError::Other {
        context: format!("{} program not found in eBPF object", name),
        source: Box::new(io::Error::from(io::ErrorKind::NotFound)),
    })?;

    <&mut KProbe>::try_from(program)
        .map_err(|e| classify(symbol, &format!("Failed to get {} as KProbe", name), e, false))
}

fn ensure_privileged() -> Result<(), LinkerError> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(LinkerError::PermissionDenied(
            "not running as root (CAP_BPF and CAP_PERFMON required)".to_string(),
        ));
    }
    Ok(())
}

/// Map a loader error onto the linker taxonomy using the io error it wraps
fn classify<E>(symbol: &str, context: &str, err: E, attaching: bool) -> LinkerError
where
    E: StdError + Send + Sync + 'static,
{
    match io_error_kind(&err) {
        Some(io::ErrorKind::PermissionDenied) => {
            LinkerError::PermissionDenied(format!("{}: {}", context, err))
        }
        Some(io::ErrorKind::NotFound) if attaching => {
            LinkerError::SymbolNotFound(symbol.to_string())
        }
        _ => LinkerError::Other {
            context: context.to_string(),
            source: Box::new(err),
        },
    }
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        current = e.source();
    }
    None
}

/// Whether `/proc/kallsyms` lists `symbol`
fn kallsyms_contains(symbol: &str) -> io::Result<bool> {
    let file = File::open(KALLSYMS_PATH)?;
    symbol_listed(BufReader::new(file), symbol)
}

fn symbol_listed<R: BufRead>(reader: R, symbol: &str) -> io::Result<bool> {
    for line in reader.lines() {
        let line = line?;
        // address type name [module]
        if line.split_whitespace().nth(2) == Some(symbol) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const KALLSYMS: &str = "\
ffffffff81000000 T startup_64
ffffffff813b2c10 T do_sys_openat2
ffffffffc0a01000 t ext4_lookup\t[ext4]
";

    #[test]
    fn test_symbol_listed() {
        assert!(symbol_listed(Cursor::new(KALLSYMS), "do_sys_openat2").unwrap());
        assert!(symbol_listed(Cursor::new(KALLSYMS), "ext4_lookup").unwrap());
        assert!(!symbol_listed(Cursor::new(KALLSYMS), "do_sys_open").unwrap());
    }

    #[test]
    fn test_classify_permission_error() {
        let err = io::Error::from_raw_os_error(libc::EPERM);
        assert!(matches!(
            classify("do_sys_openat2", "attach", err, true),
            LinkerError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_classify_missing_symbol_only_when_attaching() {
        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(
            classify("nope", "attach", err, true),
            LinkerError::SymbolNotFound(s) if s == "nope"
        ));

        let err = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(
            classify("nope", "load", err, false),
            LinkerError::Other { .. }
        ));
    }

    #[test]
    fn test_missing_object_file() {
        let result = AyaLinker::new(Path::new("/nonexistent/probe.o"), "hello_world");
        assert!(result.is_err());
    }
}
