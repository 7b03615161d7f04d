//! Memory manager policy bits

use std::fmt;
use std::ops::BitOr;

/// Policy of a memory manager
///
/// A manager's policy is a combination of these bits. Only the combinations
/// accepted by [`super::create_mem_manager`] produce a working manager; all
/// others yield a void manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemPolicy(u32);

impl MemPolicy {
    /// Null manager, every allocation fails
    pub const VOID: Self = Self(0);
    /// Plain manager over the host heap or another manager
    pub const MEM_MANAGER: Self = Self(1);
    /// Single fixed region
    pub const STATIC: Self = Self(2);
    /// Puddle pool
    pub const POOLED: Self = Self(4);
    /// Keeps a record of live blocks, freed at destroy
    pub const TRACKING: Self = Self(8);
    /// Every call guarded by a mutex
    pub const TASK_SAFE: Self = Self(0x100);
    /// Message payloads
    pub const MESSAGE: Self = Self(0x200);

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Combine two policies
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Same policy without `other`'s bits
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for MemPolicy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for MemPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MemPolicy, &str); 6] = [
            (MemPolicy::MEM_MANAGER, "MEM_MANAGER"),
            (MemPolicy::STATIC, "STATIC"),
            (MemPolicy::POOLED, "POOLED"),
            (MemPolicy::TRACKING, "TRACKING"),
            (MemPolicy::TASK_SAFE, "TASK_SAFE"),
            (MemPolicy::MESSAGE, "MESSAGE"),
        ];
        if self.0 == 0 {
            return f.write_str("VOID");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.0 & !0x30f;
        if unknown != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_combination() {
        let policy = MemPolicy::STATIC | MemPolicy::TASK_SAFE;
        assert!(policy.contains(MemPolicy::STATIC));
        assert!(!policy.contains(MemPolicy::POOLED));
        assert_eq!(policy.without(MemPolicy::TASK_SAFE), MemPolicy::STATIC);
        assert_eq!(policy.bits(), 0x102);
    }

    #[test]
    fn test_policy_debug() {
        assert_eq!(format!("{:?}", MemPolicy::VOID), "VOID");
        assert_eq!(
            format!("{:?}", MemPolicy::TRACKING | MemPolicy::TASK_SAFE),
            "TRACKING | TASK_SAFE"
        );
        assert_eq!(format!("{:?}", MemPolicy(0x1000)), "0x1000");
    }
}
