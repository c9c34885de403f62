//! Recognizer registry
//!
//! Backends are registered as factories and instantiated lazily, once per
//! (engine, language) key, on first use. Instances live until `teardown`.
//! A factory that fails is not cached, so a later call retries it.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::request::Language;
use crate::vision::engines::{EngineKind, TextRecognizer};
use crate::vision::words::PageReader;

/// Builds a recognizer for one language
pub type RecognizerFactory = Box<dyn Fn(Language) -> Result<Box<dyn TextRecognizer>> + Send + Sync>;
/// Builds the full-page word reader
pub type PageReaderFactory = Box<dyn Fn() -> Result<Box<dyn PageReader>> + Send + Sync>;

pub type SharedRecognizer = Arc<Mutex<Box<dyn TextRecognizer>>>;
pub type SharedPageReader = Arc<Mutex<Box<dyn PageReader>>>;

/// Cache key for recognizer instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecognizerKey {
    pub engine: EngineKind,
    pub language: Language,
}

impl RecognizerKey {
    /// The reader engine loads one model for both Arabic hints
    pub fn new(engine: EngineKind, language: Language) -> Self {
        let language = match (engine, language) {
            (EngineKind::Reader, Language::Arabic) => Language::ArabicFrench,
            (_, language) => language,
        };
        Self { engine, language }
    }
}

/// Process-wide store of recognizer backends
#[derive(Default)]
pub struct RecognizerRegistry {
    factories: RwLock<HashMap<EngineKind, RecognizerFactory>>,
    page_reader_factory: RwLock<Option<PageReaderFactory>>,
    instances: Mutex<HashMap<RecognizerKey, SharedRecognizer>>,
    page_reader: Mutex<Option<SharedPageReader>>,
}

impl RecognizerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the compiled-in backends
    pub fn with_default_backends() -> Self {
        let registry = Self::new();

        #[cfg(feature = "tesseract")]
        {
            use crate::vision::tesseract::{TesseractPageReader, TesseractRecognizer};

            registry.register(
                EngineKind::Segmenting,
                Box::new(|lang| Ok(Box::new(TesseractRecognizer::new(lang.code(), None)?) as Box<dyn TextRecognizer>)),
            );
            registry.register(
                EngineKind::Reader,
                Box::new(|lang| {
                    Ok(Box::new(TesseractRecognizer::new(
                        lang.code(),
                        Some(crate::vision::engines::SegmentationMode::Auto),
                    )?) as Box<dyn TextRecognizer>)
                }),
            );
            registry.register_page_reader(Box::new(|| {
                Ok(Box::new(TesseractPageReader::new()?) as Box<dyn PageReader>)
            }));
        }

        registry
    }

    /// Register (or replace) the factory for an engine
    pub fn register(&self, engine: EngineKind, factory: RecognizerFactory) {
        self.factories.write().insert(engine, factory);
        // Instances built by the old factory are stale
        self.instances.lock().retain(|key, _| key.engine != engine);
        info!("Registered recognizer backend for {}", engine);
    }

    /// Register (or replace) the page reader factory
    pub fn register_page_reader(&self, factory: PageReaderFactory) {
        *self.page_reader_factory.write() = Some(factory);
        *self.page_reader.lock() = None;
    }

    /// Is a backend registered for this engine
    pub fn is_available(&self, engine: EngineKind) -> bool {
        self.factories.read().contains_key(&engine)
    }

    pub fn has_page_reader(&self) -> bool {
        self.page_reader_factory.read().is_some()
    }

    /// Get the recognizer for a key, building it on first use
    pub fn get(&self, engine: EngineKind, language: Language) -> Result<SharedRecognizer> {
        let key = RecognizerKey::new(engine, language);

        let mut instances = self.instances.lock();
        if let Some(existing) = instances.get(&key) {
            return Ok(existing.clone());
        }

        let factories = self.factories.read();
        let factory = factories
            .get(&engine)
            .ok_or_else(|| Error::RecognizerUnavailable(engine.to_string()))?;

        let recognizer = factory(key.language).map_err(|e| {
            warn!("Failed to initialize {} recognizer [{}]: {}", engine, key.language.code(), e);
            Error::RecognizerUnavailable(format!("{} [{}]: {}", engine, key.language.code(), e))
        })?;

        info!("Initialized {} recognizer [{}]", engine, key.language.code());
        let shared = Arc::new(Mutex::new(recognizer));
        instances.insert(key, shared.clone());
        Ok(shared)
    }

    /// Get the page reader, building it on first use
    pub fn page_reader(&self) -> Result<SharedPageReader> {
        let mut slot = self.page_reader.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }

        let factory = self.page_reader_factory.read();
        let factory = factory
            .as_ref()
            .ok_or_else(|| Error::RecognizerUnavailable("page reader".to_string()))?;
        let reader = factory()
            .map_err(|e| Error::RecognizerUnavailable(format!("page reader: {}", e)))?;

        let shared = Arc::new(Mutex::new(reader));
        *slot = Some(shared.clone());
        Ok(shared)
    }

    /// Number of live recognizer instances
    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    /// Drop every cached instance. Factories stay registered.
    pub fn teardown(&self) {
        let count = {
            let mut instances = self.instances.lock();
            let n = instances.len();
            instances.clear();
            n
        };
        *self.page_reader.lock() = None;
        info!("Recognizer registry torn down ({} instance(s) released)", count);
    }
}

static GLOBAL: Lazy<Arc<RecognizerRegistry>> =
    Lazy::new(|| Arc::new(RecognizerRegistry::with_default_backends()));

/// Process-wide registry with the compiled-in backends
pub fn global() -> Arc<RecognizerRegistry> {
    GLOBAL.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engines::tests::ConstRecognizer;
    use crate::vision::words::tests::FixedPageReader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_instances_built_once_per_key() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();

        let registry = RecognizerRegistry::new();
        registry.register(
            EngineKind::Segmenting,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ConstRecognizer("X".to_string(), 0.9)) as Box<dyn TextRecognizer>)
            }),
        );

        let a = registry.get(EngineKind::Segmenting, Language::French).unwrap();
        let b = registry.get(EngineKind::Segmenting, Language::French).unwrap();
        let _c = registry.get(EngineKind::Segmenting, Language::English).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(registry.instance_count(), 2);

        registry.teardown();
        assert_eq!(registry.instance_count(), 0);
        assert!(registry.is_available(EngineKind::Segmenting));
    }

    #[test]
    fn test_reader_shares_arabic_models() {
        assert_eq!(
            RecognizerKey::new(EngineKind::Reader, Language::Arabic),
            RecognizerKey::new(EngineKind::Reader, Language::ArabicFrench)
        );
        assert_ne!(
            RecognizerKey::new(EngineKind::Segmenting, Language::Arabic),
            RecognizerKey::new(EngineKind::Segmenting, Language::ArabicFrench)
        );
    }

    #[test]
    fn test_failed_factory_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let registry = RecognizerRegistry::new();
        registry.register(
            EngineKind::Reader,
            Box::new(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(Error::RecognizerUnavailable("model missing".to_string()))
                } else {
                    Ok(Box::new(ConstRecognizer("Y".to_string(), 0.5)) as Box<dyn TextRecognizer>)
                }
            }),
        );

        assert!(registry.get(EngineKind::Reader, Language::English).is_err());
        assert!(registry.get(EngineKind::Reader, Language::English).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_engine() {
        let registry = RecognizerRegistry::new();
        assert!(!registry.is_available(EngineKind::Reader));
        assert!(matches!(
            registry.get(EngineKind::Reader, Language::English),
            Err(Error::RecognizerUnavailable(_))
        ));
        assert!(registry.page_reader().is_err());
    }

    #[test]
    fn test_page_reader_lazy() {
        let registry = RecognizerRegistry::new();
        registry.register_page_reader(Box::new(|| {
            Ok(Box::new(FixedPageReader {
                tokens: vec![],
                calls: 0,
            }) as Box<dyn PageReader>)
        }));
        assert!(registry.has_page_reader());

        let a = registry.page_reader().unwrap();
        let b = registry.page_reader().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
