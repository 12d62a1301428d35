//! Filesystem-backed catalog of running module servers.
//!
//! The registry is the directory `<root>/run/`, one PID file per running
//! `(module, host, port)` triple named `<module_id>.<host>.<port>.pid` and
//! containing the server process id as decimal text. Module ids are
//! character-restricted so the filenames parse unambiguously, IPv4 dotted
//! hosts included.
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ParsedModule;
use crate::net::probe_load;
use crate::Error;

const PORT_RANGE: std::ops::Range<u16> = 10000..65000;

/// One running-server record, as encoded in a PID filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    /// The module this server hosts
    pub module_id: String,
    /// Host the server listens on
    pub host: String,
    /// Port the server listens on
    pub port: u16,
}

impl ServerDescriptor {
    /// The PID filename for this triple.
    pub fn filename(&self) -> String {
        format!("{}.{}.{}.pid", self.module_id, self.host, self.port)
    }

    /// Parse a PID filename back into its triple: first dot-separated field
    /// is the module id, last is the port, everything between (rejoined with
    /// `.`) is the host.
    pub fn parse(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".pid")?;
        let fields: Vec<&str> = stem.split('.').collect();
        if fields.len() < 3 {
            return None;
        }
        let module_id = fields[0];
        let port: u16 = fields[fields.len() - 1].parse().ok()?;
        let host = fields[1..fields.len() - 1].join(".");
        if module_id.is_empty() || host.is_empty() {
            return None;
        }
        Some(ServerDescriptor {
            module_id: module_id.into(),
            host,
            port,
        })
    }
}

/// A probed live server attached to a module's in-memory server list.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    /// Host the server answers on
    pub host: String,
    /// Port the server answers on
    pub port: u16,
    /// Reported load; `0.0` idle, `1.0` saturated, `>1.0` overloaded
    pub load: f64,
}

/// The PID-file catalog under one root directory.
pub struct ServerRegistry {
    root: PathBuf,
}

impl ServerRegistry {
    /// Registry rooted at `<root>/run/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ServerRegistry { root: root.into() }
    }

    /// The registry directory itself.
    pub fn dir(&self) -> PathBuf {
        self.root.join("run")
    }

    fn ensure_dir(&self) -> Result<(), Error> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(|source| Error::DocumentIo {
            path: dir.display().to_string(),
            source,
        })
    }

    fn path_of(&self, descriptor: &ServerDescriptor) -> PathBuf {
        self.dir().join(descriptor.filename())
    }

    /// Every parseable PID file, with its recorded process id.
    pub fn entries(&self) -> Result<Vec<(ServerDescriptor, u32)>, Error> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let listing = std::fs::read_dir(&dir).map_err(|source| Error::DocumentIo {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in listing.flatten() {
            let name = entry.file_name();
            let Some(descriptor) = name.to_str().and_then(ServerDescriptor::parse) else {
                continue;
            };
            let Ok(raw) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(pid) = raw.trim().parse::<u32>() else {
                warn!(file = %entry.path().display(), "unparseable PID file content");
                continue;
            };
            out.push((descriptor, pid));
        }
        out.sort_by(|a, b| a.0.filename().cmp(&b.0.filename()));
        Ok(out)
    }

    /// Record a started server. The file is flushed and synced before the
    /// call returns.
    pub fn write_pid(&self, descriptor: &ServerDescriptor, pid: u32) -> Result<(), Error> {
        self.ensure_dir()?;
        let path = self.path_of(descriptor);
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&path)?;
            writeln!(file, "{}", pid)?;
            file.sync_all()
        };
        write().map_err(|source| Error::DocumentIo {
            path: path.display().to_string(),
            source,
        })
    }

    /// Remove one server record, tolerating an already-missing file.
    pub fn remove(&self, descriptor: &ServerDescriptor) -> Result<(), Error> {
        let path = self.path_of(descriptor);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::DocumentIo {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Delete every PID file unconditionally. Still-running servers become
    /// orphans; callers are expected to warn about that.
    pub fn wipe(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for (descriptor, _) in self.entries()? {
            self.remove(&descriptor)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Probe every registered server with the 250 ms load probe and collect
    /// the live ones per module. Non-replies are skipped silently; every
    /// invocation rebuilds the lists from scratch.
    pub async fn find_servers(&self) -> Result<BTreeMap<String, Vec<ServerStatus>>, Error> {
        let mut found: BTreeMap<String, Vec<ServerStatus>> = BTreeMap::new();
        for (descriptor, _pid) in self.entries()? {
            match probe_load(&descriptor.host, descriptor.port).await {
                Some(load) => {
                    debug!(
                        module = descriptor.module_id,
                        host = descriptor.host,
                        port = descriptor.port,
                        load,
                        "server is live"
                    );
                    found.entry(descriptor.module_id.clone()).or_default().push(
                        ServerStatus {
                            host: descriptor.host,
                            port: descriptor.port,
                            load,
                        },
                    );
                }
                None => continue,
            }
        }
        Ok(found)
    }

    /// For each given non-local module whose configured server list names
    /// this host, spawn a detached child process running
    /// `startserver --config <config> <module> <host> <port>` and record its
    /// PID file. Returns the started descriptors.
    pub async fn start_servers(
        &self,
        modules: &[ParsedModule],
        only: Option<&[String]>,
        config_path: &Path,
    ) -> Result<Vec<ServerDescriptor>, Error> {
        let this_host = local_host_names();
        let exe = std::env::current_exe().map_err(|source| Error::DocumentIo {
            path: "current_exe".into(),
            source,
        })?;
        let mut started = Vec::new();

        for module in modules {
            if let Some(subset) = only {
                if !subset.contains(&module.id) {
                    continue;
                }
            }
            for server in &module.servers {
                if !this_host.contains(&server.host) {
                    continue;
                }
                let port = match server.port {
                    Some(p) => p,
                    None => pick_free_port().ok_or_else(|| {
                        Error::ExecutionError("no free port available in 10000-65000".into())
                    })?,
                };
                let descriptor = ServerDescriptor {
                    module_id: module.id.clone(),
                    host: server.host.clone(),
                    port,
                };
                let child = tokio::process::Command::new(&exe)
                    .arg("startserver")
                    .arg("--config")
                    .arg(config_path)
                    .arg(&module.id)
                    .arg(&server.host)
                    .arg(port.to_string())
                    .spawn()
                    .map_err(Error::Transport)?;
                let pid = child.id().ok_or_else(|| {
                    Error::ExecutionError(format!("server child for {} exited at once", module.id))
                })?;
                self.write_pid(&descriptor, pid)?;
                info!(
                    module = module.id,
                    host = server.host,
                    port,
                    pid,
                    "module server started"
                );
                started.push(descriptor);
            }
        }
        Ok(started)
    }

    /// Send a graceful termination signal to every registered server whose
    /// host is one of this host's names, then remove its PID file. A process
    /// that is already gone is not an error.
    pub fn stop_servers(&self, only: Option<&[String]>) -> Result<Vec<ServerDescriptor>, Error> {
        let this_host = local_host_names();
        let mut stopped = Vec::new();
        for (descriptor, pid) in self.entries()? {
            if let Some(subset) = only {
                if !subset.contains(&descriptor.module_id) {
                    continue;
                }
            }
            if !this_host.contains(&descriptor.host) {
                continue;
            }
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => info!(
                    module = descriptor.module_id,
                    host = descriptor.host,
                    port = descriptor.port,
                    pid,
                    "module server stopped"
                ),
                Err(nix::errno::Errno::ESRCH) => {
                    debug!(pid, "server process already gone")
                }
                Err(e) => {
                    warn!(pid, error = %e, "failed to signal server process")
                }
            }
            self.remove(&descriptor)?;
            stopped.push(descriptor);
        }
        Ok(stopped)
    }
}

/// The set of names counted as "this host": the fully qualified domain
/// name, the short hostname, the hostname's resolved address, and
/// loopback. The FQDN comes from reverse-resolving the hostname's
/// address, since the short name and the domain-qualified one differ on
/// multi-domain hosts.
pub fn local_host_names() -> HashSet<String> {
    let mut names: HashSet<String> = HashSet::new();
    let _ = names.insert("127.0.0.1".into());
    let short = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => return names,
    };
    if let Ok(addrs) = dns_lookup::lookup_host(&short) {
        for ip in &addrs {
            let _ = names.insert(ip.to_string());
        }
        if let Some(fqdn) = addrs.iter().find_map(|ip| dns_lookup::lookup_addr(ip).ok()) {
            let _ = names.insert(fqdn);
        }
    }
    let _ = names.insert(short);
    names
}

/// Pick a random free TCP port in 10000-65000, verified by a test bind.
pub fn pick_free_port() -> Option<u16> {
    for _ in 0..128 {
        let port = PORT_RANGE.start + fastrand::u16(..(PORT_RANGE.end - PORT_RANGE.start));
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Some(port);
        }
    }
    None
}
