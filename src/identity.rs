use uuid::Uuid;

use crate::registry::InstanceRecord;

/// The identity tuple one process holds for its lifetime.
///
/// `port` is late-bound: the port binder fills it in once a listener is
/// actually bound, and the identity is immutable from then on. Every
/// registry write this process makes reflects the bound value.
#[derive(Clone, Debug)]
pub struct InstanceIdentity {
    /// `<pid>-<8 hex chars>`; the random suffix survives pid reuse within
    /// the registry's retention window.
    pub id: String,
    /// Human label, usually the workspace/project name.
    pub name: String,
    /// Absolute path; hosts pass a synthetic value for untitled workspaces.
    pub workspace_path: String,
    pub pid: u32,
    pub port: u16,
}

impl InstanceIdentity {
    pub fn new(name: impl Into<String>, workspace_path: impl Into<String>) -> Self {
        let pid = std::process::id();
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self {
            id: format!("{pid}-{suffix}"),
            name: name.into(),
            workspace_path: workspace_path.into(),
            pid,
            port: 0,
        }
    }

    /// Fix the bound port. Called exactly once, after the listener exists.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The registry record advertising this instance.
    pub fn to_record(&self, last_heartbeat: i64) -> InstanceRecord {
        InstanceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            workspace_path: self.workspace_path.clone(),
            port: self.port,
            pid: self.pid,
            last_heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_pid_plus_hex_suffix() {
        let identity = InstanceIdentity::new("web", "/home/dev/web");
        let (pid, suffix) = identity.id.split_once('-').expect("id has a dash");
        assert_eq!(pid, std::process::id().to_string());
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_differ_between_instances() {
        let a = InstanceIdentity::new("a", "/a");
        let b = InstanceIdentity::new("b", "/b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn record_reflects_bound_port() {
        let identity = InstanceIdentity::new("web", "/home/dev/web").with_port(41975);
        let record = identity.to_record(1_000);
        assert_eq!(record.port, 41975);
        assert_eq!(record.id, identity.id);
        assert_eq!(record.last_heartbeat, 1_000);
    }
}
