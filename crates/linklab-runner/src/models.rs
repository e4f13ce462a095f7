//! The propagation model parameterization table.
//!
//! Maps a model ordinal to a display name, a channel dispatch action and any
//! topology side effect. The supported set is closed: an out-of-range
//! ordinal is rejected before any simulation resources are created.

use crate::RunnerError;
use linklab_engine::ChannelSettings;
use linklab_propagation::{
    FixedRssLoss, FriisLoss, NakagamiLoss, PropagationLoss, ThreeLogDistanceLoss, TwoRayGroundLoss,
};

/// Constant receive power used by the fixed-signal model, in dBm.
pub const FIXED_RSS_DBM: f64 = -80.0;

/// Antenna mast height used by the ground-reflection model, in meters.
/// The same value is applied as a z offset to both endpoints so the two-ray
/// geometry is non-degenerate.
pub const ANTENNA_HEIGHT_M: f64 = 1.0;

/// The supported propagation loss models, selected by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationModel {
    /// Free-space loss.
    Friis,
    /// Constant receive power; validates the measurement pipeline.
    FixedRss,
    /// Three-segment log-distance loss.
    ThreeLogDistance,
    /// Two-ray ground reflection.
    TwoRayGround,
    /// Nakagami-m fading.
    Nakagami,
}

/// Channel dispatch action for a selected model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchAction {
    /// Attach the named model with no extra parameters.
    Default,
    /// Attach the named model with one fixed receive-power parameter.
    FixedSignal {
        /// Constant receive power in dBm.
        rss_dbm: f64,
    },
    /// Attach the named model with an antenna-height parameter and raise
    /// both endpoints by the same height.
    GroundReflection {
        /// Antenna mast height in meters.
        antenna_height_m: f64,
    },
}

impl DispatchAction {
    /// Z offset this action applies to both endpoints.
    pub fn z_offset_m(&self) -> f64 {
        match self {
            DispatchAction::GroundReflection { antenna_height_m } => *antenna_height_m,
            _ => 0.0,
        }
    }
}

impl PropagationModel {
    /// All supported models, in ordinal order.
    pub const ALL: [PropagationModel; 5] = [
        PropagationModel::Friis,
        PropagationModel::FixedRss,
        PropagationModel::ThreeLogDistance,
        PropagationModel::TwoRayGround,
        PropagationModel::Nakagami,
    ];

    /// Resolve a model ordinal.
    ///
    /// An out-of-range ordinal is a fatal configuration error.
    pub fn from_ordinal(ordinal: usize) -> Result<Self, RunnerError> {
        Self::ALL.get(ordinal).copied().ok_or_else(|| {
            RunnerError::Config(format!(
                "propagation model ordinal {ordinal} out of range (supported: 0..={})",
                Self::ALL.len() - 1
            ))
        })
    }

    /// Display name, used for result-file naming and logging.
    pub fn name(&self) -> &'static str {
        match self {
            PropagationModel::Friis => "FriisPropagationLossModel",
            PropagationModel::FixedRss => "FixedRssLossModel",
            PropagationModel::ThreeLogDistance => "ThreeLogDistancePropagationLossModel",
            PropagationModel::TwoRayGround => "TwoRayGroundPropagationLossModel",
            PropagationModel::Nakagami => "NakagamiPropagationLossModel",
        }
    }

    /// The dispatch action this model applies to the channel builder.
    pub fn action(&self) -> DispatchAction {
        match self {
            PropagationModel::FixedRss => DispatchAction::FixedSignal { rss_dbm: FIXED_RSS_DBM },
            PropagationModel::TwoRayGround => DispatchAction::GroundReflection {
                antenna_height_m: ANTENNA_HEIGHT_M,
            },
            _ => DispatchAction::Default,
        }
    }

    /// Instantiate the loss model for the given channel configuration.
    pub fn build_loss(
        &self,
        channel: &ChannelSettings,
    ) -> Result<Box<dyn PropagationLoss>, RunnerError> {
        let frequency_hz = channel.center_frequency_hz();
        let loss: Box<dyn PropagationLoss> = match (self, self.action()) {
            (_, DispatchAction::FixedSignal { rss_dbm }) => Box::new(FixedRssLoss::new(rss_dbm)),
            (_, DispatchAction::GroundReflection { antenna_height_m }) => {
                Box::new(TwoRayGroundLoss::new(frequency_hz, antenna_height_m)?)
            }
            (PropagationModel::ThreeLogDistance, _) => Box::new(ThreeLogDistanceLoss::default()),
            (PropagationModel::Nakagami, _) => Box::new(NakagamiLoss::default()),
            _ => Box::new(FriisLoss::new(frequency_hz)?),
        };
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_map_to_documented_models() {
        let names: Vec<&str> = (0..5)
            .map(|i| PropagationModel::from_ordinal(i).unwrap().name())
            .collect();
        assert_eq!(
            names,
            vec![
                "FriisPropagationLossModel",
                "FixedRssLossModel",
                "ThreeLogDistancePropagationLossModel",
                "TwoRayGroundPropagationLossModel",
                "NakagamiPropagationLossModel",
            ]
        );
    }

    #[test]
    fn out_of_range_ordinal_is_rejected() {
        assert!(PropagationModel::from_ordinal(5).is_err());
        assert!(PropagationModel::from_ordinal(usize::MAX).is_err());
    }

    #[test]
    fn dispatch_actions_match_documented_mapping() {
        use DispatchAction::*;
        assert_eq!(PropagationModel::Friis.action(), Default);
        assert_eq!(
            PropagationModel::FixedRss.action(),
            FixedSignal { rss_dbm: FIXED_RSS_DBM }
        );
        assert_eq!(PropagationModel::ThreeLogDistance.action(), Default);
        assert_eq!(
            PropagationModel::TwoRayGround.action(),
            GroundReflection { antenna_height_m: ANTENNA_HEIGHT_M }
        );
        assert_eq!(PropagationModel::Nakagami.action(), Default);
    }

    #[test]
    fn only_ground_reflection_offsets_topology() {
        for model in PropagationModel::ALL {
            let expected = match model {
                PropagationModel::TwoRayGround => ANTENNA_HEIGHT_M,
                _ => 0.0,
            };
            assert_eq!(model.action().z_offset_m(), expected, "{}", model.name());
        }
    }

    #[test]
    fn every_model_builds_a_loss_instance() {
        let channel = ChannelSettings::ht40_5ghz();
        for model in PropagationModel::ALL {
            let loss = model.build_loss(&channel).unwrap();
            assert_eq!(loss.name(), model.name());
        }
    }
}
