//! # Bpf
//!
//! libbpf-backed loader: the production implementation of the loader
//! collaborator.
//!
//! Artifacts go through libbpf's two phases: `load` only opens the object,
//! which keeps its read-only globals writable, and the kernel-side load is
//! forced by the first attach. Handler invocations are surfaced by watching
//! the tracefs pipe the reference programs print to.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::Path,
    sync::{Arc, Mutex},
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use elf::{abi, endian::AnyEndian, ElfBytes};
use libbpf_rs::{Link, Object, ObjectBuilder, OpenObject};
use log::{debug, warn};

use crate::{
    core::{
        artifact::{ArtifactManifest, ConfigSlot, HandlerDescriptor, SlotWidth},
        attacher::HookSpec,
        collector::Emitter,
        errors::HarnessError,
        kernel,
        loader::{ArtifactId, AttachToken, ProgramLoader},
    },
    helpers::signals::Running,
};
use events::HookKind;

/// ELF sections holding probe handlers in compiled artifacts.
const KPROBE_SECTION_PREFIX: &str = "kprobe/";
const KRETPROBE_SECTION_PREFIX: &str = "kretprobe/";
/// Section backing the configuration slots.
const RODATA_SECTION: &str = ".rodata";
/// Pipes the kernel prints trace messages to, most recent location first.
const TRACE_PIPES: &[&str] = &[
    "/sys/kernel/tracing/trace_pipe",
    "/sys/kernel/debug/tracing/trace_pipe",
];

pub(crate) struct BpfLoader {
    state: Mutex<LoaderState>,
    watcher: Mutex<Option<TracePipeWatcher>>,
}

#[derive(Default)]
struct LoaderState {
    next_id: u64,
    artifacts: HashMap<u64, LoadedArtifact>,
    next_token: u64,
    /// token -> (artifact id, handler name, link).
    links: HashMap<u64, (u64, String, Link)>,
}

struct LoadedArtifact {
    /// Offset and size of each slot inside the read-only data.
    slot_layout: HashMap<String, (usize, usize)>,
    /// None only if a kernel-side load failed, poisoning the artifact.
    object: Option<ArtifactObject>,
}

/// libbpf phases of an artifact. Globals can only be written in the open
/// phase; attaching requires the loaded one.
enum ArtifactObject {
    Open(OpenObject),
    Loaded(Object),
}

impl LoadedArtifact {
    /// Force the kernel-side load, a no-op if it already happened.
    fn ensure_loaded(&mut self) -> Result<()> {
        match self.object.take() {
            Some(ArtifactObject::Open(open)) => {
                self.object = Some(ArtifactObject::Loaded(open.load()?));
                Ok(())
            }
            Some(loaded) => {
                self.object = Some(loaded);
                Ok(())
            }
            None => bail!("A previous kernel load failed"),
        }
    }
}

impl BpfLoader {
    pub(crate) fn new() -> BpfLoader {
        BpfLoader {
            state: Mutex::new(LoaderState::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Start watching the trace pipe for `handler`, starting the watcher
    /// thread on first use.
    fn watch(&self, handler: &str, emitter: Emitter) -> Result<()> {
        let mut guard = self.watcher.lock().unwrap();
        if guard.is_none() {
            *guard = Some(TracePipeWatcher::start()?);
        }
        if let Some(watcher) = guard.as_ref() {
            watcher.watch(handler, emitter);
        }
        Ok(())
    }

    fn unwatch(&self, handler: &str) {
        if let Some(watcher) = self.watcher.lock().unwrap().as_ref() {
            watcher.unwatch(handler);
        }
    }
}

impl ProgramLoader for BpfLoader {
    fn inspect(&self, path: &Path) -> Result<ArtifactManifest> {
        let (manifest, _) = manifest_from_elf(path)?;
        Ok(manifest)
    }

    fn load(&self, path: &Path) -> Result<ArtifactId> {
        let (_, slot_layout) = manifest_from_elf(path)?;
        let open = ObjectBuilder::default()
            .open_file(path)
            .with_context(|| format!("Could not open {}", path.display()))?;

        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.artifacts.insert(
            id,
            LoadedArtifact {
                slot_layout,
                object: Some(ArtifactObject::Open(open)),
            },
        );

        Ok(ArtifactId(id))
    }

    fn write_global(&self, id: ArtifactId, slot: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let artifact = state
            .artifacts
            .get_mut(&id.0)
            .ok_or_else(|| anyhow!("{id} is not loaded"))?;

        let (offset, size) = *artifact
            .slot_layout
            .get(slot)
            .ok_or_else(|| anyhow!("No slot {slot} in {id}"))?;
        if bytes.len() != size {
            bail!("Value size mismatch for slot {slot} ({} != {size})", bytes.len());
        }

        let open = match artifact.object.as_mut() {
            Some(ArtifactObject::Open(open)) => open,
            _ => bail!("Cannot write {slot}: {id} is already loaded in the kernel"),
        };
        let mut map = open
            .maps_mut()
            .find(|m| m.name().to_str().is_some_and(|n| n.ends_with(RODATA_SECTION)))
            .ok_or_else(|| anyhow!("{id} has no read-only data"))?;
        let data = map
            .initial_value_mut()
            .ok_or_else(|| anyhow!("Read-only data of {id} is not accessible"))?;
        if offset + size > data.len() {
            bail!("Slot {slot} is out of the read-only data bounds");
        }

        data[offset..offset + size].copy_from_slice(bytes);
        Ok(())
    }

    fn attach(&self, id: ArtifactId, spec: &HookSpec, emitter: &Emitter) -> Result<AttachToken> {
        // Validate the target is a probeable kernel function first.
        if !kernel::symbols()?.contains(&spec.symbol) {
            return Err(HarnessError::SymbolNotFound(spec.symbol.clone()).into());
        }

        // Watch before attaching, so invocations triggered right away get
        // attributed.
        self.watch(&spec.handler, emitter.clone())?;

        let res: Result<AttachToken> = (|| {
            let mut state = self.state.lock().unwrap();

            let link = {
                let artifact = state
                    .artifacts
                    .get_mut(&id.0)
                    .ok_or_else(|| anyhow!("{id} is not loaded"))?;
                artifact.ensure_loaded()?;

                let obj = match artifact.object.as_mut() {
                    Some(ArtifactObject::Loaded(obj)) => obj,
                    _ => bail!("{id} is not loaded in the kernel"),
                };
                let prog = obj
                    .progs_mut()
                    .find(|p| p.name() == spec.handler.as_str())
                    .ok_or_else(|| anyhow!("No program {} in {id}", spec.handler))?;

                prog.attach_kprobe(spec.kind == HookKind::Return, spec.symbol.as_str())?
            };

            let token = state.next_token;
            state.next_token += 1;
            state
                .links
                .insert(token, (id.0, spec.handler.clone(), link));

            Ok(AttachToken(token))
        })();

        if res.is_err() {
            self.unwatch(&spec.handler);
        }
        res
    }

    fn detach(&self, _id: ArtifactId, token: AttachToken) -> Result<()> {
        let (_, handler, link) = self
            .state
            .lock()
            .unwrap()
            .links
            .remove(&token.0)
            .ok_or_else(|| anyhow!("Unknown attach token"))?;

        self.unwatch(&handler);
        // Dropping the link detaches the program from its hook point.
        drop(link);
        Ok(())
    }

    fn unload(&self, id: ArtifactId) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.links.values().any(|(a, _, _)| *a == id.0) {
            bail!("{id} still has attached handlers");
        }
        state
            .artifacts
            .remove(&id.0)
            .ok_or_else(|| anyhow!("{id} is not loaded"))?;
        Ok(())
    }
}

/// Recover the artifact manifest from the ELF object itself: handlers are
/// function symbols in kprobe/kretprobe sections, configuration slots are
/// objects in the read-only data. Also returns the slot layout (offset and
/// size within the read-only data), needed for global writes.
#[allow(clippy::type_complexity)]
fn manifest_from_elf(path: &Path) -> Result<(ArtifactManifest, HashMap<String, (usize, usize)>)> {
    let file_data =
        fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(file_data.as_slice())
        .with_context(|| format!("Could not parse {}", path.display()))?;

    let (shdrs, strtab) = file.section_headers_with_strtab()?;
    let (shdrs, strtab) = match (shdrs, strtab) {
        (Some(shdrs), Some(strtab)) => (shdrs, strtab),
        _ => bail!("Artifact has no section headers"),
    };
    let mut section_names = Vec::new();
    for shdr in shdrs.iter() {
        section_names.push(strtab.get(shdr.sh_name as usize)?);
    }

    let (symtab, symstr) = file
        .symbol_table()?
        .ok_or_else(|| anyhow!("Artifact has no symbol table"))?;

    let mut handlers = Vec::new();
    let mut slots = Vec::new();
    let mut slot_layout = HashMap::new();

    for sym in symtab.iter() {
        if sym.is_undefined() {
            continue;
        }
        let name = symstr.get(sym.st_name as usize)?;
        if name.is_empty() {
            continue;
        }
        let section = match section_names.get(sym.st_shndx as usize) {
            Some(section) => *section,
            None => continue,
        };

        match sym.st_symtype() {
            abi::STT_FUNC => {
                let (kind, target) = if let Some(t) = section.strip_prefix(KPROBE_SECTION_PREFIX) {
                    (HookKind::Entry, t)
                } else if let Some(t) = section.strip_prefix(KRETPROBE_SECTION_PREFIX) {
                    (HookKind::Return, t)
                } else {
                    continue;
                };

                handlers.push(HandlerDescriptor {
                    name: name.to_string(),
                    kind,
                    target: target.to_string(),
                });
            }
            abi::STT_OBJECT if section == RODATA_SECTION => {
                let width = match SlotWidth::from_size(sym.st_size as usize) {
                    Ok(width) => width,
                    Err(_) => {
                        debug!("Skipping read-only object {name} ({} bytes)", sym.st_size);
                        continue;
                    }
                };

                slot_layout.insert(
                    name.to_string(),
                    (sym.st_value as usize, sym.st_size as usize),
                );
                slots.push((sym.st_value, ConfigSlot::new(name, width)));
            }
            _ => (),
        }
    }

    // The slot table follows the object layout.
    slots.sort_by_key(|(offset, _)| *offset);

    let name = match path.file_stem() {
        Some(stem) => stem.to_string_lossy().into_owned(),
        None => "artifact".to_string(),
    };

    Ok((
        ArtifactManifest {
            name,
            handlers,
            slots: slots.into_iter().map(|(_, slot)| slot).collect(),
        },
        slot_layout,
    ))
}

/// Watches the tracefs pipe and attributes printk output from attached
/// handlers to the right emitter.
struct TracePipeWatcher {
    run: Running,
    handlers: Arc<Mutex<HashMap<String, Emitter>>>,
}

impl TracePipeWatcher {
    fn start() -> Result<TracePipeWatcher> {
        let file = TRACE_PIPES
            .iter()
            .find_map(|path| File::open(path).ok())
            .ok_or_else(|| anyhow!("Could not open the trace pipe: is tracefs mounted?"))?;

        let run = Running::ignore_signals();
        let handlers = Arc::new(Mutex::new(HashMap::new()));

        let (r, h) = (run.clone(), Arc::clone(&handlers));
        // The reading thread cannot be joined (the pipe read blocks until
        // kernel activity); it exits on its own once told to terminate.
        thread::Builder::new()
            .name("probehost-trace-pipe".into())
            .spawn(move || {
                let mut reader = BufReader::new(file);
                let mut line = String::new();

                while r.running() {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => dispatch(&h.lock().unwrap(), &line),
                        Err(e) => {
                            warn!("Could not read from the trace pipe: {e}");
                            break;
                        }
                    }
                }
            })?;

        Ok(TracePipeWatcher { run, handlers })
    }

    fn watch(&self, handler: &str, emitter: Emitter) {
        self.handlers
            .lock()
            .unwrap()
            .insert(handler.to_string(), emitter);
    }

    fn unwatch(&self, handler: &str) {
        self.handlers.lock().unwrap().remove(handler);
    }
}

impl Drop for TracePipeWatcher {
    fn drop(&mut self) {
        self.run.terminate();
    }
}

/// Attribute one trace pipe line to an attached handler. The printed message
/// is handler-defined, so attribution is by handler name, falling back to
/// the only attached handler when there is a single one.
fn dispatch(handlers: &HashMap<String, Emitter>, line: &str) {
    if !line.contains("bpf_trace_printk") {
        return;
    }

    if let Some((name, emitter)) = handlers
        .iter()
        .find(|(name, _)| line.contains(name.as_str()))
    {
        emitter.fire(name);
        return;
    }
    if handlers.len() == 1 {
        if let Some((name, emitter)) = handlers.iter().next() {
            emitter.fire(name);
        }
        return;
    }

    debug!("Unattributed trace line: {}", line.trim_end());
}
