//! Resource-limit helpers.
//!
//! Pure logic over `struct rlimit` values. Reading and raising the limits
//! happens in the ABI crate's probe.

use serde::Serialize;

/// Infinity sentinel for resource limits.
pub const RLIM_INFINITY: u64 = u64::MAX;

/// Resource limit values (like `struct rlimit`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rlimit {
    /// Soft limit.
    pub rlim_cur: u64,
    /// Hard limit (ceiling for soft limit).
    pub rlim_max: u64,
}

/// Returns `true` if the rlimit has a valid relationship (soft <= hard).
#[inline]
#[must_use]
pub fn valid_rlimit(rlim: &Rlimit) -> bool {
    rlim.rlim_cur <= rlim.rlim_max
}

/// The limit with its soft value raised to the hard ceiling, or `None` when
/// there is nothing to raise.
#[must_use]
pub fn raised_soft_limit(rlim: &Rlimit) -> Option<Rlimit> {
    (valid_rlimit(rlim) && rlim.rlim_cur < rlim.rlim_max).then_some(Rlimit {
        rlim_cur: rlim.rlim_max,
        rlim_max: rlim.rlim_max,
    })
}

/// Byte ceiling implied by an `RLIMIT_DATA` soft value.
///
/// Infinite and zero limits impose nothing.
#[must_use]
pub fn effective_data_limit(rlim_cur: u64) -> Option<usize> {
    if rlim_cur == RLIM_INFINITY || rlim_cur == 0 {
        None
    } else {
        Some(usize::try_from(rlim_cur).unwrap_or(usize::MAX))
    }
}

/// Whether a request of `size` bytes on top of `total` tracked bytes would
/// exceed `limit` and must skip the system heap.
#[must_use]
pub fn data_limit_redirects(limit: Option<usize>, total: usize, size: usize) -> bool {
    match limit {
        Some(limit) => total.checked_add(size).is_none_or(|sum| sum > limit),
        None => false,
    }
}

/// Values captured once when a managed context is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceProbe {
    /// Platform page size in bytes.
    pub page_size: usize,
    /// Finite `RLIMIT_DATA` soft limit, if any.
    pub data_limit: Option<usize>,
    /// `RLIMIT_NOFILE` after the soft limit was raised.
    pub nofile: Option<Rlimit>,
}

impl ResourceProbe {
    /// Probe result that imposes no limit.
    #[must_use]
    pub const fn unlimited(page_size: usize) -> Self {
        Self {
            page_size,
            data_limit: None,
            nofile: None,
        }
    }

    #[must_use]
    pub fn redirects(&self, total: usize, size: usize) -> bool {
        data_limit_redirects(self.data_limit, total, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_rlimit() {
        assert!(valid_rlimit(&Rlimit {
            rlim_cur: 100,
            rlim_max: 200,
        }));
        assert!(valid_rlimit(&Rlimit {
            rlim_cur: RLIM_INFINITY,
            rlim_max: RLIM_INFINITY,
        }));
        assert!(!valid_rlimit(&Rlimit {
            rlim_cur: 300,
            rlim_max: 200,
        }));
    }

    #[test]
    fn test_raised_soft_limit() {
        let raised = raised_soft_limit(&Rlimit {
            rlim_cur: 1024,
            rlim_max: 4096,
        });
        assert_eq!(
            raised,
            Some(Rlimit {
                rlim_cur: 4096,
                rlim_max: 4096,
            })
        );
        assert_eq!(
            raised_soft_limit(&Rlimit {
                rlim_cur: 4096,
                rlim_max: 4096,
            }),
            None
        );
    }

    #[test]
    fn test_effective_data_limit() {
        assert_eq!(effective_data_limit(RLIM_INFINITY), None);
        assert_eq!(effective_data_limit(0), None);
        assert_eq!(effective_data_limit(1 << 20), Some(1 << 20));
    }

    #[test]
    fn test_data_limit_redirects() {
        assert!(!data_limit_redirects(None, usize::MAX - 1, 100));
        assert!(!data_limit_redirects(Some(1000), 400, 600));
        assert!(data_limit_redirects(Some(1000), 400, 601));
        assert!(data_limit_redirects(Some(1000), usize::MAX, 1));

        let probe = ResourceProbe {
            page_size: 4096,
            data_limit: Some(8192),
            nofile: None,
        };
        assert!(probe.redirects(8000, 193));
        assert!(!ResourceProbe::unlimited(4096).redirects(8000, 193));
    }
}
