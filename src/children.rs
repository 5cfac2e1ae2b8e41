//! Per-application worker processes: loading their configs, spawning them under the right
//! user, handing them connections, and killing them.

use super::error::{Error, Result};
use super::passfd::DescriptorChannel;
use super::settings::{HostSettings, SettingSource};
use super::socket::FastcgiStream;

use nix::errno::Errno;
use nix::unistd::{Gid, Uid, User};
use serde::Deserialize;
use tokio::process::{Child, Command};

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The keys the host itself reads from an application config file. Anything else in the file
/// is for the worker.
#[derive(Debug, Default, Deserialize)]
struct AppFile {
    name: Option<String>,
    user: Option<String>,
    launcher: Option<String>,
}

/// The OS user a worker runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
}

impl From<User> for Identity {
    fn from(user: User) -> Identity {
        Identity {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
        }
    }
}

impl Identity {
    pub fn from_name(name: &str) -> Result<Identity> {
        match User::from_name(name) {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(Error::UnknownUser(name.to_owned())),
            Err(errno) => Err(Error::Io(errno.into())),
        }
    }

    pub fn from_uid(uid: Uid) -> Result<Identity> {
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(user.into()),
            Ok(None) => Err(Error::UnknownUser(uid.to_string())),
            Err(errno) => Err(Error::Io(errno.into())),
        }
    }
}

/// One application the process manager runs a worker for.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    /// The config file, passed to the worker as `--app-config`.
    pub path: PathBuf,
    pub identity: Identity,
    pub launcher: String,
}

impl AppConfig {
    /// Read an application config. Its `user` and `launcher` keys override `host` at app-config
    /// rank. Without a `user`, the worker runs as the file's owner.
    pub fn load(path: &Path, host: &HostSettings) -> Result<AppConfig> {
        let text = fs::read_to_string(path)?;
        let file: AppFile = toml::from_str(&text).map_err(|source| Error::Config {
            path: path.to_owned(),
            source,
        })?;

        let mut settings = host.clone();
        if let Some(ref user) = file.user {
            settings.user.set_raw(user, SettingSource::AppConfig)?;
        }
        if let Some(ref launcher) = file.launcher {
            settings.launcher.set_raw(launcher, SettingSource::AppConfig)?;
        }

        let identity = match settings.user.get() {
            Some(name) => Identity::from_name(name)?,
            None => Identity::from_uid(Uid::from_raw(fs::metadata(path)?.uid()))?,
        };

        let name = file.name.unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        });

        Ok(AppConfig {
            name,
            path: path.to_owned(),
            identity,
            launcher: settings.launcher.get().clone(),
        })
    }

    /// Load every `*.toml` file in `dir`, in name order. Files that fail to load are logged
    /// and skipped.
    pub fn load_dir(dir: &Path, host: &HostSettings) -> Result<Vec<AppConfig>> {
        let mut paths = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "toml") && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut apps = vec![];
        for path in paths {
            match AppConfig::load(&path, host) {
                Ok(app) => {
                    debug!("loaded app {} from {} (user {})",
                           app.name, path.display(), app.identity.name);
                    apps.push(app);
                },
                Err(e) => error!("skipping app config {}: {}", path.display(), e),
            }
        }
        Ok(apps)
    }
}

struct ChildProcess {
    name: String,
    pid: u32,
    identity: Identity,
    child: Child,
    channel: Arc<DescriptorChannel>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of live worker processes.
///
/// Each worker gets one end of a socket pair as its stdin; connections are handed to it over
/// that channel. Workers that exit are noticed and dropped, never respawned.
#[derive(Default)]
pub struct ChildManager {
    children: Mutex<Vec<ChildProcess>>,
    next: AtomicUsize,
}

impl ChildManager {
    pub fn new() -> ChildManager {
        ChildManager::default()
    }

    /// Spawn one worker for `app`. Returns its pid.
    pub fn spawn(&self, app: &AppConfig) -> Result<u32> {
        let spawn_error = |source: io::Error| Error::Spawn { name: app.name.clone(), source };

        let mut words = app.launcher.split_whitespace();
        let program = words.next().ok_or_else(|| Error::InvalidSetting {
            name: "launcher".to_owned(),
            value: app.launcher.clone(),
            reason: "empty command".to_owned(),
        })?;

        let (channel, theirs) = DescriptorChannel::pair().map_err(spawn_error)?;

        let mut command = Command::new(program);
        command.args(words)
            .arg("--app-config")
            .arg(&app.path)
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .kill_on_drop(true);

        let euid = Uid::effective();
        if euid.is_root() {
            command.uid(app.identity.uid.as_raw()).gid(app.identity.gid.as_raw());
        } else if euid != app.identity.uid {
            warn!("not running as root; app {} runs as uid {} instead of {}",
                  app.name, euid, app.identity.name);
        }

        let child = command.spawn().map_err(spawn_error)?;
        let pid = child.id().unwrap_or(0);
        info!("spawned worker {} for app {} as {}", pid, app.name, app.identity.name);

        lock(&self.children).push(ChildProcess {
            name: app.name.clone(),
            pid,
            identity: app.identity.clone(),
            child,
            channel: Arc::new(channel),
        });
        Ok(pid)
    }

    /// Spawn a worker for each app. Failures are logged; returns how many started.
    pub fn start_children(&self, apps: &[AppConfig]) -> usize {
        let mut started = 0;
        for app in apps {
            match self.spawn(app) {
                Ok(_) => started += 1,
                Err(e) => error!("{}", e),
            }
        }
        started
    }

    /// Drop children that have exited.
    fn prune(children: &mut Vec<ChildProcess>) {
        children.retain_mut(|child| match child.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("worker {} for app {} exited ({}); not respawning",
                      child.pid, child.name, status);
                false
            },
            Err(e) => {
                warn!("cannot check worker {} for app {}: {}", child.pid, child.name, e);
                false
            },
        });
    }

    /// Pids of the children still running.
    pub fn live_children(&self) -> Vec<u32> {
        let mut children = lock(&self.children);
        ChildManager::prune(&mut children);
        children.iter().map(|child| child.pid).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.children).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_child(&self) -> Result<(u32, Arc<DescriptorChannel>)> {
        let mut children = lock(&self.children);
        ChildManager::prune(&mut children);
        if children.is_empty() {
            return Err(Error::NoWorkers);
        }
        let child = &children[self.next.fetch_add(1, Ordering::Relaxed) % children.len()];
        Ok((child.pid, Arc::clone(&child.channel)))
    }

    /// Pass the connection's descriptor to the next live worker, round robin. The caller still
    /// owns its copy of `stream` and should drop it (without shutting it down) afterwards.
    pub async fn dispatch(&self, stream: &FastcgiStream) -> Result<u32> {
        loop {
            let (pid, channel) = self.next_child()?;
            match channel.send(stream.as_fd()).await {
                Ok(()) => {
                    debug!("passed connection to worker {}", pid);
                    return Ok(pid);
                },
                Err(e) => {
                    warn!("cannot pass connection to worker {}: {}; dropping it", pid, e);
                    lock(&self.children).retain(|child| child.pid != pid);
                },
            }
        }
    }

    /// Force-kill every child and wait for it. Children that already exited, including ones
    /// that exit between the check and the kill, are not an error.
    pub async fn kill_children(&self) {
        let children: Vec<ChildProcess> = lock(&self.children).drain(..).collect();
        for mut child in children {
            match child.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("worker {} ({}) had already exited: {}", child.pid, child.name, status);
                    continue;
                },
                Ok(None) => (),
                Err(e) => warn!("cannot check worker {}: {}", child.pid, e),
            }

            match child.child.start_kill() {
                Ok(()) => {
                    debug!("killed worker {} ({}, user {})",
                           child.pid, child.name, child.identity.name);
                },
                Err(ref e) if e.kind() == io::ErrorKind::InvalidInput
                    || e.raw_os_error() == Some(Errno::ESRCH as i32) =>
                {
                    debug!("worker {} exited before it could be killed", child.pid);
                },
                Err(e) => warn!("failed to kill worker {}: {}", child.pid, e),
            }

            match child.child.wait().await {
                Ok(status) => info!("worker {} ({}) finished: {}", child.pid, child.name, status),
                Err(e) => warn!("failed to reap worker {}: {}", child.pid, e),
            }
        }
    }

    // TODO: a graceful stop (SIGTERM, wait with a deadline, then kill) alongside kill_children.
}
