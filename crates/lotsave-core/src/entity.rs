//! Tracked entities.

use crate::id::{Cid, ClassId, TableId};
use crate::scheduler::TickScheduler;
use crate::serializer::TrackedEntity;

/// A tracked gameplay object: its instance table in the runtime heap plus
/// its private schedule.
#[derive(Debug, Clone)]
pub struct Entity {
    cid: Cid,
    class: ClassId,
    root: TableId,
    pub schedule: TickScheduler,
    /// Cleared when a creation hook or scheduled call fails.
    pub healthy: bool,
}

impl Entity {
    pub fn new(cid: Cid, class: ClassId, root: TableId) -> Self {
        Self {
            cid,
            class,
            root,
            schedule: TickScheduler::new(),
            healthy: true,
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn class(&self) -> &ClassId {
        &self.class
    }

    pub fn root(&self) -> TableId {
        self.root
    }

    pub fn tracked(&self) -> TrackedEntity<'_> {
        TrackedEntity {
            cid: &self.cid,
            class: &self.class,
            root: self.root,
            schedule: &self.schedule,
            healthy: self.healthy,
        }
    }
}

impl From<crate::builder::StagedEntity> for Entity {
    fn from(staged: crate::builder::StagedEntity) -> Self {
        Self {
            cid: staged.cid,
            class: staged.class,
            root: staged.root,
            schedule: staged.schedule,
            healthy: staged.healthy,
        }
    }
}
