//! Mobility description for simulated radio nodes.

use serde::{Deserialize, Serialize};

/// A 3-D vector in simulator coordinates (metres, or metres per second).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3(pub f64, pub f64, pub f64);

/// Simulator mobility model
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobilityModel {
    #[default]
    ConstantPosition,
    ConstantVelocity,
    /// Any other simulator type id, passed through verbatim
    Other(String),
}

impl MobilityModel {
    /// Simulator type id for this model.
    pub fn type_id(&self) -> &str {
        match self {
            MobilityModel::ConstantPosition => "ns3::ConstantPositionMobilityModel",
            MobilityModel::ConstantVelocity => "ns3::ConstantVelocityMobilityModel",
            MobilityModel::Other(type_id) => type_id,
        }
    }
}

/// Mobility of one simulated node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Mobility {
    pub model: MobilityModel,
    pub position: Option<Vector3>,
    /// Only applied for [`MobilityModel::ConstantVelocity`]
    pub velocity: Option<Vector3>,
}

impl Mobility {
    pub fn fixed(position: Vector3) -> Self {
        Self {
            model: MobilityModel::ConstantPosition,
            position: Some(position),
            velocity: None,
        }
    }

    pub fn moving(position: Vector3, velocity: Vector3) -> Self {
        Self {
            model: MobilityModel::ConstantVelocity,
            position: Some(position),
            velocity: Some(velocity),
        }
    }

    /// Velocity that will actually be set on the node.
    pub fn effective_velocity(&self) -> Option<Vector3> {
        match self.model {
            MobilityModel::ConstantVelocity => self.velocity,
            _ => None,
        }
    }
}
