//! Classifier boundary
//!
//! The station does not train or run models itself. A classification phase
//! hands its finalized [`FeatureVector`] to whatever implements
//! [`Classifier`] and attaches the returned label to the phase report.

use thiserror::Error;

use crate::types::FeatureVector;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("feature {0:?} is required by the model but not measured")]
    MissingFeature(String),

    #[error("classifier failed: {0}")]
    Failed(String),
}

/// `predict(feature_vector) -> label | error`
pub trait Classifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<String, ClassifierError>;
}

impl<F> Classifier for F
where
    F: Fn(&FeatureVector) -> Result<String, ClassifierError> + Send + Sync,
{
    fn predict(&self, features: &FeatureVector) -> Result<String, ClassifierError> {
        self(features)
    }
}

/// Pick the model's input columns out of a feature vector, in model order.
pub fn select_features(
    features: &FeatureVector,
    columns: &[&str],
) -> Result<Vec<f64>, ClassifierError> {
    columns
        .iter()
        .map(|name| {
            features
                .get(name)
                .ok_or_else(|| ClassifierError::MissingFeature((*name).to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelSet;

    fn features() -> FeatureVector {
        FeatureVector::new(ChannelSet::new(["MQ2", "MQ3", "MQ135"]), vec![1.0, 2.0, 3.0]).unwrap()
    }

    #[test]
    fn test_select_features_in_model_order() {
        assert_eq!(
            select_features(&features(), &["MQ135", "MQ2"]).unwrap(),
            vec![3.0, 1.0]
        );
        assert_eq!(
            select_features(&features(), &["MQ9"]),
            Err(ClassifierError::MissingFeature("MQ9".to_string()))
        );
    }

    #[test]
    fn test_closure_classifier() {
        let threshold = |f: &FeatureVector| -> Result<String, ClassifierError> {
            let v = select_features(f, &["MQ3"])?;
            Ok(if v[0] > 1.5 { "ethanol" } else { "air" }.to_string())
        };
        assert_eq!(threshold.predict(&features()).unwrap(), "ethanol");
    }
}
