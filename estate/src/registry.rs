//! The ordered remote registry (spec §4.2): `uid -> Estate` plus a
//! `name -> uid` index, both order-preserving.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::estate::Estate;
use crate::socket::HostAddr;

/// Owns every remote estate known to a stack, indexed by uid with a
/// secondary name index, both preserving insertion order.
#[derive(Debug, Default)]
pub struct Registry {
    remotes: IndexMap<u32, Estate>,
    uids: IndexMap<String, u32>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remotes currently registered.
    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    /// Whether the registry holds no remotes.
    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Iterates remotes in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Estate)> {
        self.remotes.iter()
    }

    /// Iterates remotes mutably in registry order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut Estate)> {
        self.remotes.iter_mut()
    }

    /// Adds `remote` to the registry under `uid` (or `remote.uid` if
    /// `uid` is `None`), failing if either the uid or the name already
    /// exists (against the registry or `local_uid`/`local_name`).
    pub fn add_remote(
        &mut self,
        mut remote: Estate,
        uid: Option<u32>,
        local_uid: u32,
        local_name: &str,
    ) -> Result<u32> {
        let uid = uid.unwrap_or(remote.uid);
        if uid != 0 && (self.remotes.contains_key(&uid) || uid == local_uid) {
            return Err(Error::Stack(format!(
                "cannot add remote at uid '{uid}', already exists"
            )));
        }
        if remote.name == local_name || self.uids.contains_key(&remote.name) {
            return Err(Error::Stack(format!(
                "cannot add remote with name '{}', already exists",
                remote.name
            )));
        }
        remote.uid = uid;
        self.uids.insert(remote.name.clone(), uid);
        self.remotes.insert(uid, remote);
        Ok(uid)
    }

    /// Removes the remote at `uid`, returning it if present.
    pub fn remove_remote(&mut self, uid: u32) -> Result<Estate> {
        let Some(remote) = self.remotes.shift_remove(&uid) else {
            return Err(Error::Stack(format!(
                "cannot remove remote '{uid}', does not exist"
            )));
        };
        self.uids.shift_remove(&remote.name);
        Ok(remote)
    }

    /// Moves the remote currently at `old` to `new`, preserving its
    /// ordinal position in the registry (spec §4.2: "must not reduce this
    /// to a delete+append").
    pub fn move_remote(&mut self, old: u32, new: u32, local_uid: u32) -> Result<()> {
        if new == local_uid || self.remotes.contains_key(&new) {
            return Err(Error::Stack(format!(
                "cannot move remote to '{new}', already exists"
            )));
        }
        let Some(index) = self.remotes.get_index_of(&old) else {
            return Err(Error::Stack(format!(
                "cannot move remote '{old}', does not exist"
            )));
        };
        let (_, mut remote) = self.remotes.shift_remove_index(index).expect("index just looked up");
        remote.uid = new;
        self.uids.insert(remote.name.clone(), new);
        self.remotes.shift_insert(index, new, remote);
        Ok(())
    }

    /// Renames the remote named `old` to `new`, preserving its ordinal
    /// position in the name index.
    pub fn rename_remote(&mut self, old: &str, new: &str, local_name: &str) -> Result<()> {
        if new == local_name || self.uids.contains_key(new) {
            return Err(Error::Stack(format!(
                "cannot rename remote to '{new}', already exists"
            )));
        }
        let Some(index) = self.uids.get_index_of(old) else {
            return Err(Error::Stack(format!(
                "cannot rename remote '{old}', does not exist"
            )));
        };
        let uid = *self.uids.get(old).expect("index just looked up");
        self.uids.shift_remove_index(index);
        self.uids.shift_insert(index, new.to_string(), uid);
        if let Some(remote) = self.remotes.get_mut(&uid) {
            remote.name = new.to_string();
        }
        Ok(())
    }

    /// Looks up a remote by uid.
    pub fn get(&self, uid: u32) -> Option<&Estate> {
        self.remotes.get(&uid)
    }

    /// Looks up a remote mutably by uid.
    pub fn get_mut(&mut self, uid: u32) -> Option<&mut Estate> {
        self.remotes.get_mut(&uid)
    }

    /// Finds a remote by name.
    pub fn fetch_by_name(&self, name: &str) -> Option<&Estate> {
        self.uids.get(name).and_then(|uid| self.remotes.get(uid))
    }

    /// Finds a remote whose host address matches exactly.
    pub fn fetch_by_ha(&self, ha: &HostAddr) -> Option<&Estate> {
        self.remotes.values().find(|r| &r.ha == ha)
    }

    /// Finds a remote whose host and port match (same as `fetch_by_ha`
    /// for this crate's `HostAddr = SocketAddr`, kept distinct to mirror
    /// the original `fetchRemoteByHostPort`/`fetchRemoteByHa` split).
    pub fn fetch_by_host_port(&self, host: std::net::IpAddr, port: u16) -> Option<&Estate> {
        self.remotes
            .values()
            .find(|r| r.ha.ip() == host && r.ha.port() == port)
    }

    /// Finds a remote whose sign or box key hex matches.
    pub fn fetch_by_keys(&self, sighex: &str, prihex: &str) -> Option<&Estate> {
        self.remotes
            .values()
            .find(|r| r.sighex == sighex || r.prihex == prihex)
    }

    /// First remote in registry order, the "zeroth" default destination.
    pub fn first(&self) -> Option<&Estate> {
        self.remotes.values().next()
    }

    /// Removes every remote from the registry.
    pub fn clear(&mut self) {
        self.remotes.clear();
        self.uids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(name: &str) -> Estate {
        Estate::new(name, "127.0.0.1:9000".parse().unwrap())
    }

    #[test]
    fn add_then_fetch_by_name() {
        let mut reg = Registry::new();
        let uid = reg.add_remote(remote("bob"), Some(5), 1, "alice").unwrap();
        assert_eq!(uid, 5);
        assert_eq!(reg.fetch_by_name("bob").unwrap().uid, 5);
    }

    #[test]
    fn add_rejects_duplicate_uid() {
        let mut reg = Registry::new();
        reg.add_remote(remote("bob"), Some(5), 1, "alice").unwrap();
        let err = reg.add_remote(remote("carol"), Some(5), 1, "alice");
        assert!(err.is_err());
    }

    #[test]
    fn add_rejects_duplicate_name() {
        let mut reg = Registry::new();
        reg.add_remote(remote("bob"), Some(5), 1, "alice").unwrap();
        let err = reg.add_remote(remote("bob"), Some(6), 1, "alice");
        assert!(err.is_err());
    }

    #[test]
    fn move_remote_preserves_position() {
        let mut reg = Registry::new();
        reg.add_remote(remote("bob"), Some(1), 100, "alice").unwrap();
        reg.add_remote(remote("carol"), Some(2), 100, "alice").unwrap();
        reg.move_remote(1, 9, 100).unwrap();

        let order: Vec<u32> = reg.iter().map(|(uid, _)| *uid).collect();
        assert_eq!(order, vec![9, 2]);
        assert_eq!(reg.fetch_by_name("bob").unwrap().uid, 9);
    }

    #[test]
    fn rename_remote_preserves_name_index_position() {
        let mut reg = Registry::new();
        reg.add_remote(remote("bob"), Some(1), 100, "alice").unwrap();
        reg.rename_remote("bob", "robert", "alice").unwrap();
        assert!(reg.fetch_by_name("bob").is_none());
        assert_eq!(reg.fetch_by_name("robert").unwrap().uid, 1);
    }

    #[test]
    fn remove_remote_drops_name_index_too() {
        let mut reg = Registry::new();
        reg.add_remote(remote("bob"), Some(1), 100, "alice").unwrap();
        reg.remove_remote(1).unwrap();
        assert!(reg.fetch_by_name("bob").is_none());
        assert!(reg.get(1).is_none());
    }
}
