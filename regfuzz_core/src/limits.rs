use crate::config::LimitSettings;
use crate::error::HarnessError;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitResource {
    CoreFileSize,
    DataSegSize,
}

impl LimitResource {
    pub fn name(&self) -> &'static str {
        match self {
            LimitResource::CoreFileSize => "core file size",
            LimitResource::DataSegSize => "data seg size",
        }
    }
}

/// Soft and hard limit pair. `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    pub resource: LimitResource,
    pub soft: u64,
}

fn min_limit(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// New limits for `limit` given the current ones. The hard limit is lowered to the
/// requested value but never raised above what the process already has.
pub fn plan_limit(limit: &LimitSpec, old: Bound) -> Bound {
    let hard = min_limit(Some(limit.soft), old.hard);
    Bound {
        soft: min_limit(Some(limit.soft), hard),
        hard,
    }
}

fn fmt_limit(limit: Option<u64>) -> String {
    limit.map_or_else(|| "unlimited".to_string(), |v| v.to_string())
}

/// Applies a fixed table of process ceilings.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimiter {
    table: Vec<LimitSpec>,
}

impl ResourceLimiter {
    pub fn new(table: Vec<LimitSpec>) -> Self {
        Self { table }
    }

    pub fn from_settings(settings: &LimitSettings) -> Self {
        if !settings.apply {
            return Self::default();
        }
        Self::new(vec![
            LimitSpec {
                resource: LimitResource::CoreFileSize,
                soft: settings.core_file_size,
            },
            LimitSpec {
                resource: LimitResource::DataSegSize,
                soft: settings.data_seg_size,
            },
        ])
    }

    pub fn table(&self) -> &[LimitSpec] {
        &self.table
    }

    pub fn apply(&self) -> Result<(), HarnessError> {
        for limit in &self.table {
            let name = limit.resource.name();
            let to_err = |source| HarnessError::ResourceLimit {
                resource: name,
                source,
            };
            let old = sys::get(limit.resource).map_err(to_err)?;
            let new = plan_limit(limit, old);
            info!(
                "setting {} to {} / {} (was {} / {})",
                name,
                fmt_limit(new.soft),
                fmt_limit(new.hard),
                fmt_limit(old.soft),
                fmt_limit(old.hard)
            );
            sys::set(limit.resource, new).map_err(to_err)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
mod sys {
    use super::{Bound, LimitResource};
    use std::io;

    fn from_raw(value: libc::rlim_t) -> Option<u64> {
        if value == libc::RLIM_INFINITY {
            None
        } else {
            Some(value as u64)
        }
    }

    fn to_raw(value: Option<u64>) -> libc::rlim_t {
        value.map_or(libc::RLIM_INFINITY, |v| v as libc::rlim_t)
    }

    pub fn get(resource: LimitResource) -> io::Result<Bound> {
        let mut raw = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `raw` is a valid, writable rlimit.
        let rc = unsafe {
            match resource {
                LimitResource::CoreFileSize => libc::getrlimit(libc::RLIMIT_CORE, &mut raw),
                LimitResource::DataSegSize => libc::getrlimit(libc::RLIMIT_DATA, &mut raw),
            }
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Bound {
            soft: from_raw(raw.rlim_cur),
            hard: from_raw(raw.rlim_max),
        })
    }

    pub fn set(resource: LimitResource, bound: Bound) -> io::Result<()> {
        let raw = libc::rlimit {
            rlim_cur: to_raw(bound.soft),
            rlim_max: to_raw(bound.hard),
        };
        // SAFETY: `raw` is a valid rlimit for the duration of the call.
        let rc = unsafe {
            match resource {
                LimitResource::CoreFileSize => libc::setrlimit(libc::RLIMIT_CORE, &raw),
                LimitResource::DataSegSize => libc::setrlimit(libc::RLIMIT_DATA, &raw),
            }
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod sys {
    use super::{Bound, LimitResource};
    use std::io;

    pub fn get(_resource: LimitResource) -> io::Result<Bound> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "resource limits require a unix host",
        ))
    }

    pub fn set(_resource: LimitResource, _bound: Bound) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "resource limits require a unix host",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORE: LimitSpec = LimitSpec {
        resource: LimitResource::CoreFileSize,
        soft: 0,
    };

    #[test]
    fn lowers_unlimited_hard_limit() {
        let new = plan_limit(
            &CORE,
            Bound {
                soft: None,
                hard: None,
            },
        );
        assert_eq!(
            new,
            Bound {
                soft: Some(0),
                hard: Some(0)
            }
        );
    }

    #[test]
    fn never_raises_existing_hard_limit() {
        let limit = LimitSpec {
            resource: LimitResource::DataSegSize,
            soft: 200_000_000,
        };
        let new = plan_limit(
            &limit,
            Bound {
                soft: Some(50_000_000),
                hard: Some(100_000_000),
            },
        );
        assert_eq!(new.hard, Some(100_000_000));
        assert_eq!(new.soft, Some(100_000_000));
    }

    #[test]
    fn disabled_settings_produce_empty_table() {
        let settings = LimitSettings {
            apply: false,
            ..LimitSettings::default()
        };
        let limiter = ResourceLimiter::from_settings(&settings);
        assert!(limiter.table().is_empty());
        assert!(limiter.apply().is_ok());
    }

    #[test]
    fn default_table_disables_core_dumps_and_caps_data() {
        let limiter = ResourceLimiter::from_settings(&LimitSettings::default());
        assert_eq!(limiter.table()[0], CORE);
        assert_eq!(limiter.table()[1].soft, 200_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn current_limits_are_readable() {
        assert!(sys::get(LimitResource::CoreFileSize).is_ok());
    }
}
