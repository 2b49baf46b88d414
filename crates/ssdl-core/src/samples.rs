use std::{fmt::Display, sync::Arc};

use indexmap::IndexMap;
use log::{info, warn};

use crate::{
    config::SampleRecord,
    data::{EventRecord, EventSource, JsonLinesSource, VecSource},
    utils::enums::{SampleKind, Stream},
    SsdlError, SsdlResult,
};

/// Where the events of a [`Sample`] come from.
#[derive(Clone, Debug)]
pub enum SourceLocator {
    /// A JSON-lines file (path as given, expanded on open).
    File(String),
    /// Events held in memory.
    Memory(Arc<Vec<EventRecord>>),
}

/// A registered collection of events with its normalization.
#[derive(Clone, Debug)]
pub struct Sample {
    pub name: String,
    /// Short name, used as the key in yield stores and tables.
    pub sname: String,
    pub locator: SourceLocator,
    /// Integrated luminosity in pb^-1.
    pub lumi: f64,
    pub kind: SampleKind,
    pub stream: Option<Stream>,
    pub color: i32,
    scale: f64,
}

impl Sample {
    /// Build a sample and fix its normalization: `target_lumi / lumi` for simulation, one for
    /// data.
    pub fn new(
        name: &str,
        sname: &str,
        locator: SourceLocator,
        lumi: f64,
        kind: SampleKind,
        stream: Option<Stream>,
        target_lumi: f64,
    ) -> SsdlResult<Self> {
        let scale = if kind.is_simulation() {
            if !lumi.is_finite() || lumi <= 0.0 {
                return Err(SsdlError::ConfigError {
                    name: name.to_string(),
                    reason: format!("simulated sample needs a positive lumi, got {}", lumi),
                });
            }
            target_lumi / lumi
        } else {
            1.0
        };
        Ok(Self {
            name: name.to_string(),
            sname: sname.to_string(),
            locator,
            lumi,
            kind,
            stream,
            color: 0,
            scale,
        })
    }

    /// A sample whose events live in memory.
    pub fn in_memory(
        sname: &str,
        kind: SampleKind,
        lumi: f64,
        stream: Option<Stream>,
        events: Vec<EventRecord>,
        target_lumi: f64,
    ) -> SsdlResult<Self> {
        Self::new(
            sname,
            sname,
            SourceLocator::Memory(Arc::new(events)),
            lumi,
            kind,
            stream,
            target_lumi,
        )
    }

    /// Multiplier applied to every counter of this sample before pooling.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_data(&self) -> bool {
        !self.kind.is_simulation()
    }

    /// Open a fresh event stream.
    pub fn open(&self) -> SsdlResult<Box<dyn EventSource>> {
        match &self.locator {
            SourceLocator::File(path) => Ok(Box::new(JsonLinesSource::open(path)?)),
            SourceLocator::Memory(events) => Ok(Box::new(VecSource::new(events.clone()))),
        }
    }

    /// Whether a trigger path recorded in `stream` may select events of this sample.
    ///
    /// Simulation has no primary datasets, so every path applies. Data only uses the paths of
    /// its own stream so that one event is never counted from two datasets.
    pub fn accepts_stream(&self, stream: Stream) -> bool {
        match (self.kind.is_simulation(), self.stream) {
            (true, _) => true,
            (false, Some(own)) => own == stream,
            (false, None) => true,
        }
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {}, lumi = {:.1}/pb, scale = {:.4})",
            self.sname, self.name, self.kind, self.lumi, self.scale
        )
    }
}

/// A sample which could not be registered or read.
#[derive(Clone, Debug)]
pub struct ExcludedSample {
    pub name: String,
    pub reason: SsdlError,
}

/// All samples of an analysis, keyed by short name in registration order.
#[derive(Clone, Debug, Default)]
pub struct SampleRegistry {
    target_lumi: f64,
    samples: IndexMap<String, Sample>,
    excluded: Vec<ExcludedSample>,
}

impl SampleRegistry {
    pub fn new(target_lumi: f64) -> Self {
        Self {
            target_lumi,
            samples: IndexMap::new(),
            excluded: Vec::new(),
        }
    }

    pub fn target_lumi(&self) -> f64 {
        self.target_lumi
    }

    /// Register one record. The data source is opened once to check that it is readable.
    pub fn register(&mut self, record: &SampleRecord) -> SsdlResult<&Sample> {
        record.validate()?;
        if self.samples.contains_key(&record.sname) {
            return Err(SsdlError::ConfigError {
                name: record.sname.clone(),
                reason: "a sample with this short name is already registered".to_string(),
            });
        }
        JsonLinesSource::open(&record.file).map_err(|err| SsdlError::SampleUnavailable {
            name: record.name.clone(),
            reason: err.to_string(),
        })?;
        let mut sample = Sample::new(
            &record.name,
            &record.sname,
            SourceLocator::File(record.file.clone()),
            record.lumi,
            record.kind,
            record.stream,
            self.target_lumi,
        )?;
        sample.color = record.color;
        info!("Registered sample {}", sample);
        Ok(self.add(sample))
    }

    /// Register every record, logging and remembering the ones that fail.
    ///
    /// Returns the number of samples registered.
    pub fn register_all(&mut self, records: &[SampleRecord]) -> usize {
        records
            .iter()
            .filter(|record| match self.register(record) {
                Ok(_) => true,
                Err(err) => {
                    warn!("Skipping sample {}: {}", record.name, err);
                    self.excluded.push(ExcludedSample {
                        name: record.name.clone(),
                        reason: err,
                    });
                    false
                }
            })
            .count()
    }

    /// Add an already-built sample, replacing any sample with the same short name.
    pub fn add(&mut self, sample: Sample) -> &Sample {
        let (index, _) = self.samples.insert_full(sample.sname.clone(), sample);
        &self.samples[index]
    }

    /// Remember a sample which failed after registration (for example while reading events).
    pub fn exclude(&mut self, sname: &str, reason: SsdlError) {
        let sample = self.samples.shift_remove(sname);
        let name = sample.map_or_else(|| sname.to_string(), |s| s.name);
        self.excluded.push(ExcludedSample { name, reason });
    }

    pub fn get(&self, sname: &str) -> SsdlResult<&Sample> {
        self.samples.get(sname).ok_or_else(|| SsdlError::NotFound {
            name: sname.to_string(),
            object: "sample".to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.values()
    }

    pub fn of_kind(&self, kind: SampleKind) -> Vec<&Sample> {
        self.samples.values().filter(|s| s.kind == kind).collect()
    }

    pub fn data(&self) -> Vec<&Sample> {
        self.of_kind(SampleKind::Data)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn excluded(&self) -> &[ExcludedSample] {
        &self.excluded
    }
}
