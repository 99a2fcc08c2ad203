//! Reconciliation planning.
//!
//! When a session starts, both peers exchange directory snapshots and
//! each runs the same symmetric rule over the union of paths: push what
//! the other side lacks, push a delta where the local copy is newer,
//! and stay silent otherwise. Neither side ever requests data, and a
//! path absent from the remote is treated as not-yet-known, never as
//! deleted; deletions propagate only through live events.

use rustc_hash::FxHashMap;

use crate::path::RelPath;
use crate::state::DirState;

/// The remote peer's view of one file, as carried in its snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    /// Remote modification time.
    pub mtime: f64,
    /// Remote file size.
    pub size: u64,
    /// Serialized signature of the remote content.
    pub sig: Vec<u8>,
}

/// One transfer this peer owes the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    /// Send the complete file; the remote has no copy.
    Full {
        /// Path to send.
        path: RelPath,
    },
    /// Send a delta against the remote's signature; the local copy is
    /// newer.
    Delta {
        /// Path to send.
        path: RelPath,
        /// The remote's signature of its current content.
        remote_sig: Vec<u8>,
    },
}

impl Push {
    /// The path this push transfers.
    #[must_use]
    pub fn path(&self) -> &RelPath {
        match self {
            Self::Full { path } | Self::Delta { path, .. } => path,
        }
    }
}

/// Decide every push this peer owes, full sends first, then deltas,
/// each group in path order for deterministic output.
#[must_use]
pub fn plan(local: &DirState, remote: &FxHashMap<RelPath, RemoteFile>) -> Vec<Push> {
    let mut full = Vec::new();
    let mut delta = Vec::new();

    for (path, stat) in &local.files {
        match remote.get(path) {
            None => full.push(Push::Full { path: path.clone() }),
            Some(theirs) if stat.mtime > theirs.mtime => delta.push(Push::Delta {
                path: path.clone(),
                remote_sig: theirs.sig.clone(),
            }),
            // Remote copy is newer or equal: the remote pushes, or
            // nobody does. Paths only the remote has are its to push.
            Some(_) => {}
        }
    }

    full.sort_by(|a, b| a.path().cmp(b.path()));
    delta.sort_by(|a, b| a.path().cmp(b.path()));
    full.extend(delta);
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileStat;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn local(entries: &[(&str, f64)]) -> DirState {
        let mut state = DirState::default();
        for &(path, mtime) in entries {
            state.files.insert(rel(path), FileStat { mtime, size: 1 });
        }
        state
    }

    fn remote(entries: &[(&str, f64)]) -> FxHashMap<RelPath, RemoteFile> {
        entries
            .iter()
            .map(|&(path, mtime)| {
                (
                    rel(path),
                    RemoteFile {
                        mtime,
                        size: 1,
                        sig: vec![0xAB],
                    },
                )
            })
            .collect()
    }

    #[test]
    fn missing_on_remote_is_full_send() {
        let pushes = plan(&local(&[("only-here.txt", 10.0)]), &remote(&[]));
        assert_eq!(
            pushes,
            vec![Push::Full {
                path: rel("only-here.txt")
            }]
        );
    }

    #[test]
    fn newer_local_is_delta_send() {
        let pushes = plan(&local(&[("shared.txt", 20.0)]), &remote(&[("shared.txt", 10.0)]));
        assert_eq!(pushes.len(), 1);
        assert!(matches!(
            &pushes[0],
            Push::Delta { path, remote_sig } if path == &rel("shared.txt") && remote_sig == &vec![0xAB]
        ));
    }

    #[test]
    fn older_local_is_silent() {
        let pushes = plan(&local(&[("shared.txt", 10.0)]), &remote(&[("shared.txt", 20.0)]));
        assert!(pushes.is_empty());
    }

    #[test]
    fn equal_mtime_is_silent() {
        let pushes = plan(&local(&[("shared.txt", 10.0)]), &remote(&[("shared.txt", 10.0)]));
        assert!(pushes.is_empty());
    }

    #[test]
    fn missing_locally_is_silent() {
        // The remote is the authority for what it has; it pushes to us.
        let pushes = plan(&local(&[]), &remote(&[("only-there.txt", 10.0)]));
        assert!(pushes.is_empty());
    }

    #[test]
    fn full_sends_precede_deltas_in_path_order() {
        let pushes = plan(
            &local(&[
                ("z-new.txt", 30.0),
                ("a-new.txt", 30.0),
                ("z-edit.txt", 30.0),
                ("a-edit.txt", 30.0),
            ]),
            &remote(&[("z-edit.txt", 10.0), ("a-edit.txt", 10.0)]),
        );
        let order: Vec<&str> = pushes.iter().map(|p| p.path().as_str()).collect();
        assert_eq!(order, vec!["a-new.txt", "z-new.txt", "a-edit.txt", "z-edit.txt"]);
        assert!(matches!(pushes[0], Push::Full { .. }));
        assert!(matches!(pushes[3], Push::Delta { .. }));
    }

    #[test]
    fn empty_both_sides_plans_nothing() {
        assert!(plan(&local(&[]), &remote(&[])).is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::state::FileStat;
    use proptest::prelude::*;

    fn arb_tree() -> impl Strategy<Value = Vec<(String, f64)>> {
        prop::collection::vec(("[a-z]{1,8}", 0.0f64..1000.0), 0..20)
    }

    proptest! {
        /// A second run against a remote state that absorbed the first
        /// run's pushes plans nothing.
        #[test]
        fn idempotent_after_absorption(
            local_files in arb_tree(),
            remote_files in arb_tree()
        ) {
            let mut local = DirState::default();
            for (path, mtime) in &local_files {
                if let Ok(rel) = RelPath::new(path) {
                    local.files.insert(rel, FileStat { mtime: *mtime, size: 1 });
                }
            }
            let mut remote: FxHashMap<RelPath, RemoteFile> = FxHashMap::default();
            for (path, mtime) in &remote_files {
                if let Ok(rel) = RelPath::new(path) {
                    remote.insert(rel, RemoteFile { mtime: *mtime, size: 1, sig: vec![] });
                }
            }

            let first = plan(&local, &remote);
            for push in &first {
                let stat = local.files[push.path()];
                remote.insert(push.path().clone(), RemoteFile {
                    mtime: stat.mtime,
                    size: stat.size,
                    sig: vec![],
                });
            }
            prop_assert!(plan(&local, &remote).is_empty());
        }

        /// Planning never pushes a path the remote already has a
        /// strictly newer copy of.
        #[test]
        fn never_pushes_over_newer(
            shared in "[a-z]{1,8}",
            local_mtime in 0.0f64..1000.0,
            lead in 0.001f64..100.0
        ) {
            let mut local = DirState::default();
            local.files.insert(RelPath::new(&shared).unwrap(), FileStat { mtime: local_mtime, size: 1 });
            let mut remote = FxHashMap::default();
            remote.insert(RelPath::new(&shared).unwrap(), RemoteFile {
                mtime: local_mtime + lead,
                size: 1,
                sig: vec![],
            });
            prop_assert!(plan(&local, &remote).is_empty());
        }
    }
}
