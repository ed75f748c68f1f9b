//! Message-passing fabric between ranks
//!
//! The halo exchanger and the topology setup talk to their peers through
//! this narrow surface: a post-everything-then-wait-all byte exchange and a
//! per-rank broadcast. The [`LocalFabric`] implementation connects the ranks
//! of one process through channel mailboxes, which is what the test suite
//! and single-process multi-rank runs use; the `mpi` cargo feature adds
//! [`mpi_fabric::MpiFabric`] over a real MPI library.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;
use thiserror::Error;

#[cfg(feature = "mpi")]
pub mod mpi_fabric;

/// Outgoing message: borrowed payload, destination rank, grid tag
pub struct SendMsg<'a> {
    pub peer: usize,
    pub tag: u32,
    pub bytes: &'a [u8],
}

/// Expected incoming message: source rank, grid tag, landing buffer
pub struct RecvMsg<'a> {
    pub peer: usize,
    pub tag: u32,
    pub bytes: &'a mut [u8],
}

#[derive(Debug, Error)]
pub enum FabricError {
    /// A received payload does not match the posted landing buffer
    #[error(
        "message from rank {from} with tag {tag}: payload is {got} bytes, \
         landing buffer is {expected}"
    )]
    SizeMismatch {
        from: usize,
        tag: u32,
        got: usize,
        expected: usize,
    },

    /// A peer hung up or the transport failed
    #[error("transport failure talking to rank {peer}: {reason}")]
    Transport { peer: usize, reason: String },
}

/// Byte transport between the ranks of one job
///
/// `exchange` has the semantics of posting all sends and receives without
/// blocking, then waiting for every one of them: buffers may be reused as
/// soon as it returns. Matching is by `(source rank, tag)`.
pub trait Fabric: Send + Sync {
    fn my_rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    fn exchange(&self, sends: &[SendMsg<'_>], recvs: &mut [RecvMsg<'_>])
        -> Result<(), FabricError>;

    /// Broadcast `bytes` from `root` to every rank, in place
    fn broadcast(&self, root: usize, bytes: &mut [u8]) -> Result<(), FabricError>;
}

/// Tag reserved for broadcast traffic; grid tags stay well below this.
const BCAST_TAG: u32 = u32::MAX;

struct Envelope {
    from: usize,
    tag: u32,
    payload: Vec<u8>,
}

/// In-process fabric: every rank owns an inbox, senders are shared
pub struct LocalFabric {
    rank: usize,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,

    /// Messages that arrived ahead of their matching receive
    stash: Mutex<Vec<Envelope>>,
}
//
impl LocalFabric {
    /// Wire up `num_ranks` connected fabrics, one per rank
    pub fn mesh(num_ranks: usize) -> Vec<LocalFabric> {
        assert!(num_ranks > 0);
        let (outboxes, inboxes): (Vec<_>, Vec<_>) =
            (0..num_ranks).map(|_| unbounded::<Envelope>()).unzip();
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalFabric {
                rank,
                outboxes: outboxes.clone(),
                inbox,
                stash: Mutex::new(Vec::new()),
            })
            .collect()
    }

    /// Single-rank fabric for undistributed runs
    pub fn solo() -> LocalFabric {
        Self::mesh(1).pop().expect("mesh(1) yields one fabric")
    }

    /// Pull the next message matching `(from, tag)`, consulting the stash
    /// before blocking on the inbox
    fn recv_matching(&self, from: usize, tag: u32) -> Result<Vec<u8>, FabricError> {
        {
            let mut stash = self.stash.lock().expect("fabric stash poisoned");
            if let Some(pos) = (stash.iter()).position(|e| e.from == from && e.tag == tag) {
                return Ok(stash.swap_remove(pos).payload);
            }
        }
        loop {
            let envelope = self.inbox.recv().map_err(|_| FabricError::Transport {
                peer: from,
                reason: "all peers disconnected".into(),
            })?;
            if envelope.from == from && envelope.tag == tag {
                return Ok(envelope.payload);
            }
            self.stash
                .lock()
                .expect("fabric stash poisoned")
                .push(envelope);
        }
    }

    fn post(&self, peer: usize, tag: u32, bytes: &[u8]) -> Result<(), FabricError> {
        self.outboxes[peer]
            .send(Envelope {
                from: self.rank,
                tag,
                payload: bytes.to_vec(),
            })
            .map_err(|_| FabricError::Transport {
                peer,
                reason: "peer inbox closed".into(),
            })
    }
}
//
impl Fabric for LocalFabric {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.outboxes.len()
    }

    fn exchange(
        &self,
        sends: &[SendMsg<'_>],
        recvs: &mut [RecvMsg<'_>],
    ) -> Result<(), FabricError> {
        // Channel sends never block, so posting everything up front before
        // draining receives cannot deadlock.
        for send in sends {
            self.post(send.peer, send.tag, send.bytes)?;
        }
        for recv in recvs {
            let payload = self.recv_matching(recv.peer, recv.tag)?;
            if payload.len() != recv.bytes.len() {
                return Err(FabricError::SizeMismatch {
                    from: recv.peer,
                    tag: recv.tag,
                    got: payload.len(),
                    expected: recv.bytes.len(),
                });
            }
            recv.bytes.copy_from_slice(&payload);
        }
        Ok(())
    }

    fn broadcast(&self, root: usize, bytes: &mut [u8]) -> Result<(), FabricError> {
        if self.rank == root {
            for peer in 0..self.num_ranks() {
                if peer != root {
                    self.post(peer, BCAST_TAG, bytes)?;
                }
            }
        } else {
            let payload = self.recv_matching(root, BCAST_TAG)?;
            if payload.len() != bytes.len() {
                return Err(FabricError::SizeMismatch {
                    from: root,
                    tag: BCAST_TAG,
                    got: payload.len(),
                    expected: bytes.len(),
                });
            }
            bytes.copy_from_slice(&payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn solo_fabric_is_trivial() {
        let fabric = LocalFabric::solo();
        assert_eq!(fabric.num_ranks(), 1);
        let mut bytes = [1u8, 2, 3];
        fabric.broadcast(0, &mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3]);
        fabric.exchange(&[], &mut []).unwrap();
    }

    #[test]
    fn pairwise_exchange() {
        let mut mesh = LocalFabric::mesh(2);
        let right = mesh.pop().unwrap();
        let left = mesh.pop().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                let payload = [1u8, 2, 3, 4];
                let mut landing = [0u8; 4];
                left.exchange(
                    &[SendMsg {
                        peer: 1,
                        tag: 7,
                        bytes: &payload,
                    }],
                    &mut [RecvMsg {
                        peer: 1,
                        tag: 7,
                        bytes: &mut landing,
                    }],
                )
                .unwrap();
                assert_eq!(landing, [5, 6, 7, 8]);
            });
            s.spawn(|| {
                let payload = [5u8, 6, 7, 8];
                let mut landing = [0u8; 4];
                right
                    .exchange(
                        &[SendMsg {
                            peer: 0,
                            tag: 7,
                            bytes: &payload,
                        }],
                        &mut [RecvMsg {
                            peer: 0,
                            tag: 7,
                            bytes: &mut landing,
                        }],
                    )
                    .unwrap();
                assert_eq!(landing, [1, 2, 3, 4]);
            });
        });
    }

    #[test]
    fn out_of_order_tags_are_stashed() {
        let mut mesh = LocalFabric::mesh(2);
        let right = mesh.pop().unwrap();
        let left = mesh.pop().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                // Send tag 1 then tag 0; the peer asks for 0 first.
                left.exchange(
                    &[
                        SendMsg {
                            peer: 1,
                            tag: 1,
                            bytes: &[11],
                        },
                        SendMsg {
                            peer: 1,
                            tag: 0,
                            bytes: &[10],
                        },
                    ],
                    &mut [],
                )
                .unwrap();
            });
            s.spawn(|| {
                let mut a = [0u8];
                let mut b = [0u8];
                right
                    .exchange(
                        &[],
                        &mut [
                            RecvMsg {
                                peer: 0,
                                tag: 0,
                                bytes: &mut a,
                            },
                            RecvMsg {
                                peer: 0,
                                tag: 1,
                                bytes: &mut b,
                            },
                        ],
                    )
                    .unwrap();
                assert_eq!((a, b), ([10], [11]));
            });
        });
    }

    #[test]
    fn broadcast_reaches_all_ranks() {
        let mesh = LocalFabric::mesh(3);
        thread::scope(|s| {
            for fabric in &mesh {
                s.spawn(move || {
                    let mut bytes = if fabric.my_rank() == 1 {
                        vec![42u8; 8]
                    } else {
                        vec![0u8; 8]
                    };
                    fabric.broadcast(1, &mut bytes).unwrap();
                    assert_eq!(bytes, vec![42u8; 8]);
                });
            }
        });
    }

    #[test]
    fn size_mismatch_is_reported() {
        let mut mesh = LocalFabric::mesh(2);
        let right = mesh.pop().unwrap();
        let left = mesh.pop().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                left.exchange(
                    &[SendMsg {
                        peer: 1,
                        tag: 0,
                        bytes: &[1, 2, 3],
                    }],
                    &mut [],
                )
                .unwrap();
            });
            s.spawn(|| {
                let mut landing = [0u8; 2];
                let err = right
                    .exchange(
                        &[],
                        &mut [RecvMsg {
                            peer: 0,
                            tag: 0,
                            bytes: &mut landing,
                        }],
                    )
                    .unwrap_err();
                assert!(matches!(err, FabricError::SizeMismatch { .. }));
            });
        });
    }
}
