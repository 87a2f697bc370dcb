//! Frame-level types: ChannelSet, SensorFrame, FeatureVector

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

// ============================================================================
// Channel Set
// ============================================================================

/// Fixed, ordered mapping of sensor channel name to frame position.
///
/// Built once from configuration and shared (cheaply cloned) by the parser,
/// the aggregator and the persistence store. Immutable for the lifetime of a
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSet {
    names: Arc<[String]>,
}

impl ChannelSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of channels (N) every accepted frame must carry.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Position of a channel within a frame.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// CSV header shared by every persisted file: `Label,<channels>`.
    pub fn csv_header(&self) -> String {
        let mut header = String::from("Label");
        for name in self.names.iter() {
            header.push(',');
            header.push_str(name);
        }
        header
    }
}

// ============================================================================
// Sensor Frame
// ============================================================================

/// One validated set of simultaneous channel readings.
///
/// Only constructed by [`FrameParser`](crate::acquisition::FrameParser) (or
/// test code), so `values.len()` always equals the channel count it was
/// parsed against and every value is finite.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    values: Vec<f64>,
}

impl SensorFrame {
    pub(crate) fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

// ============================================================================
// Feature Vector
// ============================================================================

/// Finalized per-channel means handed to the classifier.
///
/// Serializes as a `{ "channel": value, ... }` map in channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    channels: ChannelSet,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Pair channel names with their means. Returns `None` on width mismatch.
    pub fn new(channels: ChannelSet, values: Vec<f64>) -> Option<Self> {
        (channels.len() == values.len()).then_some(Self { channels, values })
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mean for a named channel.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.channels.position(name).map(|i| self.values[i])
    }

    /// `(name, value)` pairs in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.channels
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

impl Serialize for FeatureVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_header() {
        let channels = ChannelSet::new(["MQ2", "MQ3"]);
        assert_eq!(channels.csv_header(), "Label,MQ2,MQ3");
        assert_eq!(channels.position("MQ3"), Some(1));
        assert_eq!(channels.position("MQ135"), None);
    }

    #[test]
    fn test_feature_vector_width_checked() {
        let channels = ChannelSet::new(["A", "B"]);
        assert!(FeatureVector::new(channels.clone(), vec![1.0]).is_none());

        let fv = FeatureVector::new(channels, vec![3.0, 4.0]).unwrap();
        assert_eq!(fv.get("B"), Some(4.0));
        assert_eq!(fv.iter().collect::<Vec<_>>(), vec![("A", 3.0), ("B", 4.0)]);
    }

    #[test]
    fn test_feature_vector_serializes_as_map() {
        let fv = FeatureVector::new(ChannelSet::new(["MQ2", "MQ3"]), vec![1.5, 2.0]).unwrap();
        let json = serde_json::to_string(&fv).unwrap();
        assert_eq!(json, r#"{"MQ2":1.5,"MQ3":2.0}"#);
    }
}
