use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete connection quality of a location
///
/// `NoData` sits outside the ordered range: it means nothing has been
/// measured or the location is unknown, and never results from clamping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionScore {
    #[default]
    NoData,
    Unavailable,
    Poor,
    Good,
    Excellent,
}

impl ConnectionScore {
    /// One step up, saturating at `Excellent`
    pub fn promote(self) -> Self {
        match self {
            ConnectionScore::NoData => ConnectionScore::NoData,
            ConnectionScore::Unavailable => ConnectionScore::Poor,
            ConnectionScore::Poor => ConnectionScore::Good,
            ConnectionScore::Good | ConnectionScore::Excellent => ConnectionScore::Excellent,
        }
    }

    /// Promote only when `cond` holds
    pub fn promote_if(self, cond: bool) -> Self {
        if cond { self.promote() } else { self }
    }

    pub fn is_available(self) -> bool {
        self > ConnectionScore::Unavailable
    }

    /// Numeric level as exposed to presentation layers (NoData = -1)
    pub fn level(self) -> i8 {
        match self {
            ConnectionScore::NoData => -1,
            ConnectionScore::Unavailable => 0,
            ConnectionScore::Poor => 1,
            ConnectionScore::Good => 2,
            ConnectionScore::Excellent => 3,
        }
    }
}

impl fmt::Display for ConnectionScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionScore::NoData => "no data",
            ConnectionScore::Unavailable => "unavailable",
            ConnectionScore::Poor => "poor",
            ConnectionScore::Good => "good",
            ConnectionScore::Excellent => "excellent",
        };
        f.write_str(s)
    }
}
