use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a train registered with the engine. Trains come and go
    /// during a session, so they use generational keys.
    pub struct TrainId;
}

/// Identifies a track circuit section in the static network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionId(pub u32);

/// Identifies a signal in the static network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalId(pub u32);

/// Identifies a deadlock group (a divergence point with alternative paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeadlockId(pub u32);

/// Identifies one alternative path within a deadlock group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId(pub u32);

/// Identifies a timetable pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u32);

/// Identifies a storage track within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageId(pub u32);

macro_rules! index_impl {
    ($($ty:ident),*) => {
        $(
            impl $ty {
                /// The dense index of this id.
                #[inline]
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

index_impl!(SectionId, SignalId, DeadlockId, PathId, PoolId, StorageId);

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn section_id_equality() {
        assert_eq!(SectionId(3), SectionId(3));
        assert_ne!(SectionId(3), SectionId(4));
    }

    #[test]
    fn ids_are_ordered_by_index() {
        let mut ids = vec![SignalId(5), SignalId(1), SignalId(3)];
        ids.sort();
        assert_eq!(ids, vec![SignalId(1), SignalId(3), SignalId(5)]);
    }

    #[test]
    fn index_matches_inner_value() {
        assert_eq!(PathId(7).index(), 7);
        assert_eq!(PoolId(0).index(), 0);
    }

    #[test]
    fn train_ids_are_distinct_after_removal() {
        let mut trains = SlotMap::<TrainId, ()>::with_key();
        let a = trains.insert(());
        trains.remove(a);
        let b = trains.insert(());
        assert_ne!(a, b);
    }
}
