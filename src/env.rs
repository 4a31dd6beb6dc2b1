//! Processing-environment scope and native error capture.
//!
//! Operations that create scratch datasets need the engine's drivers to be
//! registered, which is what an [`Env`] guarantees for its lifetime. Config
//! options applied through the scope are restored on drop, in reverse order.

use std::sync::Mutex;

use tracing::debug;

use crate::config::{EngineConfig, OptionList};
use crate::engine::RasterEngine;
use crate::error::{Error, NativeError, Result};

/// Serializes save/restore of process-wide config options.
///
/// The lock is only held while swapping a value, so two overlapping scopes
/// restore correctly only when they are unwound in LIFO order.
static CONFIG_LOCK: Mutex<()> = Mutex::new(());

/// Sets a config option and restores the previous value on drop
pub struct ScopedConfigOption<'e, E: RasterEngine> {
    engine: &'e E,
    key: String,
    previous: Option<String>,
}

impl<'e, E: RasterEngine> ScopedConfigOption<'e, E> {
    pub fn new(engine: &'e E, key: &str, value: Option<&str>) -> Self {
        let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = engine.config_option(key);
        engine.set_config_option(key, value);
        Self {
            engine,
            key: key.to_uppercase(),
            previous,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value the option had before this override
    pub fn previous(&self) -> Option<&str> {
        self.previous.as_deref()
    }
}

impl<E: RasterEngine> Drop for ScopedConfigOption<'_, E> {
    fn drop(&mut self) {
        let _guard = CONFIG_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        self.engine
            .set_config_option(&self.key, self.previous.as_deref());
    }
}

/// An initialized processing environment.
///
/// ```
/// use rasterbridge::{Env, MemEngine, RasterEngine};
///
/// let engine = MemEngine::new();
/// assert!(!engine.has_driver("MEM"));
/// let env = Env::new(&engine);
/// assert!(env.engine().has_driver("MEM"));
/// ```
pub struct Env<'e, E: RasterEngine> {
    engine: &'e E,
    overrides: Vec<ScopedConfigOption<'e, E>>,
}

impl<'e, E: RasterEngine> Env<'e, E> {
    /// Registers the engine's drivers
    pub fn new(engine: &'e E) -> Self {
        engine.register_drivers();
        Self {
            engine,
            overrides: Vec::new(),
        }
    }

    /// Registers drivers and applies `config` followed by `options` for the
    /// lifetime of the scope
    pub fn with_config(engine: &'e E, config: &EngineConfig, options: &OptionList) -> Result<Self> {
        config.validate()?;
        let mut env = Self::new(engine);
        let mut merged = config.to_options();
        merged.merge(options);
        for (key, value) in merged.iter() {
            env.set_option(key, Some(value));
        }
        debug!(options = merged.len(), "entered processing environment");
        Ok(env)
    }

    pub fn engine(&self) -> &'e E {
        self.engine
    }

    /// Overrides a config option until the scope ends
    pub fn set_option(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        self.overrides
            .push(ScopedConfigOption::new(self.engine, key, value));
        self
    }
}

impl<E: RasterEngine> Drop for Env<'_, E> {
    fn drop(&mut self) {
        while let Some(option) = self.overrides.pop() {
            drop(option);
        }
    }
}

/// Intercepts native error reports raised on the current thread.
///
/// The capture remembers how deep the thread's error stack was when it was
/// created. It only looks at reports pushed after that point and truncates the
/// stack back to it on drop, so reports owned by an enclosing capture survive.
pub struct ErrorCapture<'e, E: RasterEngine> {
    engine: &'e E,
    base: usize,
}

impl<'e, E: RasterEngine> ErrorCapture<'e, E> {
    pub fn new(engine: &'e E) -> Self {
        let base = engine.error_reports().len();
        Self { engine, base }
    }

    /// Reports captured so far, oldest first
    pub fn reports(&self) -> Vec<NativeError> {
        let mut reports = self.engine.error_reports();
        if reports.len() <= self.base {
            return Vec::new();
        }
        reports.split_off(self.base)
    }

    /// Fails with the first captured Failure or Fatal report
    pub fn check(&self) -> Result<()> {
        self.check_ignoring(|_| false).map(|_| ())
    }

    /// Like [`check`](Self::check), but reports matching `expected` are not
    /// fatal; they are returned instead
    pub fn check_ignoring(&self, expected: impl Fn(&NativeError) -> bool) -> Result<Vec<NativeError>> {
        let mut ignored = Vec::new();
        for report in self.reports() {
            if expected(&report) {
                ignored.push(report);
            } else if report.is_fatal_or_failure() {
                return Err(report.into());
            }
        }
        Ok(ignored)
    }

    /// Message of the most recent report
    pub fn last_message(&self) -> Option<String> {
        self.reports().pop().map(|r| r.message)
    }

    /// The first captured failure, or `fallback` if nothing was captured
    pub fn error_or(&self, fallback: Error) -> Error {
        match self.check() {
            Err(e) => e,
            Ok(()) => fallback,
        }
    }
}

impl<E: RasterEngine> Drop for ErrorCapture<'_, E> {
    fn drop(&mut self) {
        self.engine.truncate_error_reports(self.base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DatasetH, MemEngine, MEM_DRIVER};
    use crate::error::ErrorCode;
    use crate::types::DataType;

    #[test]
    fn test_env_registers_drivers() {
        let engine = MemEngine::new();
        assert!(!engine.has_driver(MEM_DRIVER));
        let _env = Env::new(&engine);
        assert!(engine.has_driver(MEM_DRIVER));
    }

    #[test]
    fn test_env_restores_options_in_reverse() {
        let engine = MemEngine::new();
        engine.set_config_option("CHECK_WITH_INVERT_PROJ", Some("NO"));
        {
            let mut env = Env::new(&engine);
            env.set_option("CHECK_WITH_INVERT_PROJ", Some("YES"));
            env.set_option("check_with_invert_proj", Some("MAYBE"));
            env.set_option("GDAL_CACHEMAX", Some("64"));
            assert_eq!(engine.config_option("CHECK_WITH_INVERT_PROJ").as_deref(), Some("MAYBE"));
        }
        assert_eq!(engine.config_option("CHECK_WITH_INVERT_PROJ").as_deref(), Some("NO"));
        assert!(engine.config_option("GDAL_CACHEMAX").is_none());
    }

    #[test]
    fn test_env_with_config_applies_engine_defaults() {
        let engine = MemEngine::new();
        let config = EngineConfig {
            check_with_invert_proj: true,
            ..EngineConfig::default()
        };
        {
            let _env = Env::with_config(&engine, &config, &OptionList::new().with("EXTRA", 1)).unwrap();
            assert_eq!(engine.config_option("CHECK_WITH_INVERT_PROJ").as_deref(), Some("YES"));
            assert_eq!(engine.config_option("EXTRA").as_deref(), Some("1"));
        }
        assert!(engine.config_option("CHECK_WITH_INVERT_PROJ").is_none());
    }

    #[test]
    fn test_env_with_invalid_config() {
        let engine = MemEngine::new();
        let config = EngineConfig {
            num_threads: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Env::with_config(&engine, &config, &OptionList::new()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_error_capture_checks_first_failure() {
        let engine = MemEngine::new();
        let _env = Env::new(&engine);
        let capture = ErrorCapture::new(&engine);
        assert!(capture.check().is_ok());

        let _ = engine.set_crs(DatasetH(42), &crate::projection::Crs::from_epsg(4326).unwrap());
        let _ = engine.create_dataset(MEM_DRIVER, "x", 0, 1, 1, DataType::U8);
        assert_eq!(capture.reports().len(), 2);
        assert!(matches!(capture.check(), Err(Error::NullChannel(_))));
        assert!(capture.last_message().unwrap().contains("invalid dataset size"));

        let ignored = capture.check_ignoring(|r| r.code == ErrorCode::ObjectNull);
        assert!(matches!(ignored, Err(Error::InvalidInput(_))));

        drop(capture);
        assert!(engine.error_reports().is_empty());
    }

    #[test]
    fn test_nested_capture_keeps_outer_reports() {
        let engine = MemEngine::new();
        let outer = ErrorCapture::new(&engine);
        let _ = engine.set_crs(DatasetH(7), &crate::projection::Crs::from_epsg(4326).unwrap());
        assert_eq!(outer.reports().len(), 1);

        {
            let inner = ErrorCapture::new(&engine);
            assert!(inner.reports().is_empty());
            assert!(inner.check().is_ok());
            let _ = engine.create_dataset(MEM_DRIVER, "x", 0, 1, 1, DataType::U8);
            assert_eq!(inner.reports().len(), 1);
            assert_eq!(outer.reports().len(), 2);
        }

        let reports = outer.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].code, ErrorCode::ObjectNull);
        assert!(matches!(outer.check(), Err(Error::NullChannel(_))));
        drop(outer);
        assert!(engine.error_reports().is_empty());
    }

    #[test]
    fn test_capture_ignores_earlier_reports() {
        let engine = MemEngine::new();
        let _ = engine.set_crs(DatasetH(7), &crate::projection::Crs::from_epsg(4326).unwrap());
        {
            let capture = ErrorCapture::new(&engine);
            assert!(capture.check().is_ok());
            assert!(capture.last_message().is_none());
        }
        assert_eq!(engine.error_reports().len(), 1);
    }

    #[test]
    fn test_error_or_fallback() {
        let engine = MemEngine::new();
        let capture = ErrorCapture::new(&engine);
        let err = capture.error_or(Error::Io("status 7".to_string()));
        assert_eq!(err, Error::Io("status 7".to_string()));
    }
}
