//! MPI-backed fabric
//!
//! Thin adapter from the [`Fabric`](super::Fabric) surface to rsmpi:
//! `exchange` becomes immediate sends/receives collected into one wait-all,
//! `broadcast` maps to the collective of the same name. The caller owns the
//! MPI universe; this type only borrows the world communicator's lifetime
//! through a clone.

use super::{Fabric, FabricError, RecvMsg, SendMsg};
use mpi::request::RequestCollection;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

pub struct MpiFabric {
    world: SimpleCommunicator,
}
//
impl MpiFabric {
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }
}
//
impl Fabric for MpiFabric {
    fn my_rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn num_ranks(&self) -> usize {
        self.world.size() as usize
    }

    fn exchange(
        &self,
        sends: &[SendMsg<'_>],
        recvs: &mut [RecvMsg<'_>],
    ) -> Result<(), FabricError> {
        let total = sends.len() + recvs.len();
        mpi::request::multiple_scope(total, |scope, coll: &mut RequestCollection<'_, [u8]>| {
            for recv in recvs.iter_mut() {
                let req = self
                    .world
                    .process_at_rank(recv.peer as i32)
                    .immediate_receive_into_with_tag(scope, recv.bytes, recv.tag as i32);
                coll.add(req);
            }
            for send in sends {
                let req = self
                    .world
                    .process_at_rank(send.peer as i32)
                    .immediate_send_with_tag(scope, send.bytes, send.tag as i32);
                coll.add(req);
            }
            let mut statuses = Vec::with_capacity(total);
            coll.wait_all(&mut statuses);
        });
        Ok(())
    }

    fn broadcast(&self, root: usize, bytes: &mut [u8]) -> Result<(), FabricError> {
        self.world.process_at_rank(root as i32).broadcast_into(bytes);
        Ok(())
    }
}
