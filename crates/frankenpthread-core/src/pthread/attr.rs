//! Attribute objects for threads, mutexes, condition variables and
//! reader-writer locks.
//!
//! Setters validate eagerly and leave the attribute unchanged on error.

use crate::error::{SyncError, SyncResult};

use super::mutex::{MutexAttributeContract, MutexType};

pub const PTHREAD_PROCESS_PRIVATE: i32 = 0;
pub const PTHREAD_PROCESS_SHARED: i32 = 1;

pub const PTHREAD_CREATE_JOINABLE: i32 = 0;
pub const PTHREAD_CREATE_DETACHED: i32 = 1;

pub const PTHREAD_SCOPE_SYSTEM: i32 = 0;
pub const PTHREAD_SCOPE_PROCESS: i32 = 1;

pub const PTHREAD_INHERIT_SCHED: i32 = 0;
pub const PTHREAD_EXPLICIT_SCHED: i32 = 1;

pub const SCHED_OTHER: i32 = 0;
pub const SCHED_FIFO: i32 = 1;
pub const SCHED_RR: i32 = 2;

pub const PTHREAD_PRIO_NONE: i32 = 0;
pub const PTHREAD_PRIO_INHERIT: i32 = 1;
pub const PTHREAD_PRIO_PROTECT: i32 = 2;

/// Smallest stack a created thread may request.
pub const PTHREAD_STACK_MIN: usize = 16 * 1024;

/// Priority bounds for the real-time policies. `SCHED_OTHER` only takes 0.
pub const SCHED_PRIORITY_MIN: i32 = 1;
pub const SCHED_PRIORITY_MAX: i32 = 32;

fn check_pshared(pshared: i32) -> SyncResult<i32> {
    match pshared {
        PTHREAD_PROCESS_PRIVATE | PTHREAD_PROCESS_SHARED => Ok(pshared),
        _ => Err(SyncError::InvalidArgument("pshared")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedParam {
    pub priority: i32,
}

/// Thread creation attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttr {
    detach_state: i32,
    scope: i32,
    inherit_sched: i32,
    policy: i32,
    param: SchedParam,
    stack_size: Option<usize>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            detach_state: PTHREAD_CREATE_JOINABLE,
            scope: PTHREAD_SCOPE_SYSTEM,
            inherit_sched: PTHREAD_INHERIT_SCHED,
            policy: SCHED_OTHER,
            param: SchedParam::default(),
            stack_size: None,
        }
    }
}

impl ThreadAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detach_state(&mut self, state: i32) -> SyncResult<()> {
        match state {
            PTHREAD_CREATE_JOINABLE | PTHREAD_CREATE_DETACHED => {
                self.detach_state = state;
                Ok(())
            }
            _ => Err(SyncError::InvalidArgument("detach state")),
        }
    }

    #[must_use]
    pub fn detach_state(&self) -> i32 {
        self.detach_state
    }

    #[must_use]
    pub fn is_joinable(&self) -> bool {
        self.detach_state == PTHREAD_CREATE_JOINABLE
    }

    /// Threads map one-to-one onto host threads, so only system scope exists.
    pub fn set_scope(&mut self, scope: i32) -> SyncResult<()> {
        match scope {
            PTHREAD_SCOPE_SYSTEM => {
                self.scope = scope;
                Ok(())
            }
            PTHREAD_SCOPE_PROCESS => Err(SyncError::Unsupported("process contention scope")),
            _ => Err(SyncError::InvalidArgument("contention scope")),
        }
    }

    #[must_use]
    pub fn scope(&self) -> i32 {
        self.scope
    }

    pub fn set_inherit_sched(&mut self, inherit: i32) -> SyncResult<()> {
        match inherit {
            PTHREAD_INHERIT_SCHED | PTHREAD_EXPLICIT_SCHED => {
                self.inherit_sched = inherit;
                Ok(())
            }
            _ => Err(SyncError::InvalidArgument("inherit sched")),
        }
    }

    #[must_use]
    pub fn inherit_sched(&self) -> i32 {
        self.inherit_sched
    }

    pub fn set_sched_policy(&mut self, policy: i32) -> SyncResult<()> {
        match policy {
            SCHED_OTHER => {
                self.policy = policy;
                self.param.priority = 0;
                Ok(())
            }
            SCHED_FIFO | SCHED_RR => {
                self.policy = policy;
                self.param.priority = self.param.priority.max(SCHED_PRIORITY_MIN);
                Ok(())
            }
            _ => Err(SyncError::InvalidArgument("sched policy")),
        }
    }

    #[must_use]
    pub fn sched_policy(&self) -> i32 {
        self.policy
    }

    pub fn set_sched_param(&mut self, param: SchedParam) -> SyncResult<()> {
        let ok = if self.policy == SCHED_OTHER {
            param.priority == 0
        } else {
            (SCHED_PRIORITY_MIN..=SCHED_PRIORITY_MAX).contains(&param.priority)
        };
        if !ok {
            return Err(SyncError::InvalidArgument("sched priority"));
        }
        self.param = param;
        Ok(())
    }

    #[must_use]
    pub fn sched_param(&self) -> SchedParam {
        self.param
    }

    pub fn set_stack_size(&mut self, size: usize) -> SyncResult<()> {
        if size < PTHREAD_STACK_MIN {
            return Err(SyncError::InvalidArgument("stack size below minimum"));
        }
        self.stack_size = Some(size);
        Ok(())
    }

    /// Requested stack size, or `None` for the configured default.
    #[must_use]
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }
}

/// Mutex initialization attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexAttr {
    kind: MutexType,
    pshared: i32,
    robust: bool,
    protocol: i32,
}

impl MutexAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_type(kind: MutexType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn set_type(&mut self, raw: i32) -> SyncResult<()> {
        self.kind = MutexType::from_raw(raw)?;
        Ok(())
    }

    #[must_use]
    pub fn mutex_type(&self) -> MutexType {
        self.kind
    }

    pub fn set_pshared(&mut self, pshared: i32) -> SyncResult<()> {
        self.pshared = check_pshared(pshared)?;
        Ok(())
    }

    #[must_use]
    pub fn pshared(&self) -> i32 {
        self.pshared
    }

    pub fn set_robust(&mut self, robust: bool) {
        self.robust = robust;
    }

    pub fn set_protocol(&mut self, protocol: i32) -> SyncResult<()> {
        match protocol {
            PTHREAD_PRIO_NONE | PTHREAD_PRIO_INHERIT | PTHREAD_PRIO_PROTECT => {
                self.protocol = protocol;
                Ok(())
            }
            _ => Err(SyncError::InvalidArgument("mutex protocol")),
        }
    }

    /// Feature profile checked when a mutex is initialized from these attributes.
    #[must_use]
    pub fn contract(&self) -> MutexAttributeContract {
        MutexAttributeContract {
            process_shared: self.pshared == PTHREAD_PROCESS_SHARED,
            robust: self.robust,
            priority_inherit: self.protocol == PTHREAD_PRIO_INHERIT,
            priority_protect: self.protocol == PTHREAD_PRIO_PROTECT,
        }
    }
}

/// Condition variable attributes. Only process-private is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CondAttr {
    pshared: i32,
}

impl CondAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pshared(&mut self, pshared: i32) -> SyncResult<()> {
        if check_pshared(pshared)? != PTHREAD_PROCESS_PRIVATE {
            return Err(SyncError::InvalidArgument("shared condition variables"));
        }
        self.pshared = pshared;
        Ok(())
    }

    #[must_use]
    pub fn pshared(&self) -> i32 {
        self.pshared
    }
}

/// Reader-writer lock attributes. Only process-private is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RwLockAttr {
    pshared: i32,
}

impl RwLockAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pshared(&mut self, pshared: i32) -> SyncResult<()> {
        if check_pshared(pshared)? != PTHREAD_PROCESS_PRIVATE {
            return Err(SyncError::InvalidArgument("shared reader-writer locks"));
        }
        self.pshared = pshared;
        Ok(())
    }

    #[must_use]
    pub fn pshared(&self) -> i32 {
        self.pshared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_attr_defaults() {
        let attr = ThreadAttr::default();
        assert!(attr.is_joinable());
        assert_eq!(attr.scope(), PTHREAD_SCOPE_SYSTEM);
        assert_eq!(attr.sched_policy(), SCHED_OTHER);
        assert_eq!(attr.stack_size(), None);
    }

    #[test]
    fn invalid_settings_leave_attr_unchanged() {
        let mut attr = ThreadAttr::default();
        assert!(attr.set_detach_state(7).is_err());
        assert!(attr.set_stack_size(PTHREAD_STACK_MIN - 1).is_err());
        assert_eq!(
            attr.set_scope(PTHREAD_SCOPE_PROCESS),
            Err(SyncError::Unsupported("process contention scope"))
        );
        assert!(attr.set_sched_param(SchedParam { priority: 5 }).is_err());
        assert_eq!(attr, ThreadAttr::default());
    }

    #[test]
    fn realtime_policy_accepts_priority_range() {
        let mut attr = ThreadAttr::default();
        attr.set_sched_policy(SCHED_FIFO).unwrap();
        assert_eq!(attr.sched_param().priority, SCHED_PRIORITY_MIN);
        attr.set_sched_param(SchedParam { priority: 20 }).unwrap();
        assert!(attr.set_sched_param(SchedParam { priority: 99 }).is_err());
        assert_eq!(attr.sched_param().priority, 20);
    }

    #[test]
    fn mutex_attr_contract_reflects_settings() {
        let mut attr = MutexAttr::new();
        assert_eq!(attr.contract(), MutexAttributeContract::default());
        attr.set_pshared(PTHREAD_PROCESS_SHARED).unwrap();
        attr.set_protocol(PTHREAD_PRIO_INHERIT).unwrap();
        let contract = attr.contract();
        assert!(contract.process_shared);
        assert!(contract.priority_inherit);
        assert!(!contract.priority_protect);
        assert!(attr.set_pshared(5).is_err());
    }

    #[test]
    fn shared_cond_and_rwlock_attrs_rejected() {
        let mut c = CondAttr::new();
        assert!(c.set_pshared(PTHREAD_PROCESS_SHARED).is_err());
        c.set_pshared(PTHREAD_PROCESS_PRIVATE).unwrap();
        let mut r = RwLockAttr::new();
        assert!(r.set_pshared(PTHREAD_PROCESS_SHARED).is_err());
        assert_eq!(r.pshared(), PTHREAD_PROCESS_PRIVATE);
    }
}
