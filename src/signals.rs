use crate::error::BacktestError;
use crate::models::SignalAction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BOUNDED_BUY_THRESHOLD: f64 = 0.5;
const BOUNDED_SELL_THRESHOLD: f64 = -0.5;
const BAND_WIDTH_CONTRACTION_THRESHOLD: f64 = 0.1;

/// Every indicator type the upstream pipeline may publish observations for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalType {
    #[serde(rename = "MACD")]
    Macd,
    #[serde(rename = "MACD_Histogram")]
    MacdHistogram,
    #[serde(rename = "KDJ")]
    Kdj,
    #[serde(rename = "RSI")]
    Rsi,
    #[serde(rename = "CCI")]
    Cci,
    #[serde(rename = "WR")]
    Wr,
    #[serde(rename = "DMA")]
    Dma,
    #[serde(rename = "EXPMA")]
    Expma,
    #[serde(rename = "BBI")]
    Bbi,
    #[serde(rename = "ARBR")]
    Arbr,
    #[serde(rename = "VR")]
    Vr,
    #[serde(rename = "OBV")]
    Obv,
    #[serde(rename = "EMV")]
    Emv,
    #[serde(rename = "SAR")]
    Sar,
    #[serde(rename = "ROC")]
    Roc,
    #[serde(rename = "TRIX")]
    Trix,
    #[serde(rename = "MTM")]
    Mtm,
    #[serde(rename = "BOLL")]
    Boll,
    #[serde(rename = "BOLL_Width")]
    BollWidth,
    #[serde(rename = "MA")]
    Ma,
}

impl SignalType {
    pub const ALL: [SignalType; 20] = [
        SignalType::Macd,
        SignalType::MacdHistogram,
        SignalType::Kdj,
        SignalType::Rsi,
        SignalType::Cci,
        SignalType::Wr,
        SignalType::Dma,
        SignalType::Expma,
        SignalType::Bbi,
        SignalType::Arbr,
        SignalType::Vr,
        SignalType::Obv,
        SignalType::Emv,
        SignalType::Sar,
        SignalType::Roc,
        SignalType::Trix,
        SignalType::Mtm,
        SignalType::Boll,
        SignalType::BollWidth,
        SignalType::Ma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Macd => "MACD",
            SignalType::MacdHistogram => "MACD_Histogram",
            SignalType::Kdj => "KDJ",
            SignalType::Rsi => "RSI",
            SignalType::Cci => "CCI",
            SignalType::Wr => "WR",
            SignalType::Dma => "DMA",
            SignalType::Expma => "EXPMA",
            SignalType::Bbi => "BBI",
            SignalType::Arbr => "ARBR",
            SignalType::Vr => "VR",
            SignalType::Obv => "OBV",
            SignalType::Emv => "EMV",
            SignalType::Sar => "SAR",
            SignalType::Roc => "ROC",
            SignalType::Trix => "TRIX",
            SignalType::Mtm => "MTM",
            SignalType::Boll => "BOLL",
            SignalType::BollWidth => "BOLL_Width",
            SignalType::Ma => "MA",
        }
    }

    pub fn family(&self) -> SignalFamily {
        match self {
            SignalType::Macd
            | SignalType::Kdj
            | SignalType::Rsi
            | SignalType::Cci
            | SignalType::Wr
            | SignalType::Dma
            | SignalType::Expma
            | SignalType::Bbi
            | SignalType::Arbr
            | SignalType::Vr
            | SignalType::Obv
            | SignalType::Emv
            | SignalType::Sar
            | SignalType::Roc => SignalFamily::BoundedOscillator,
            SignalType::Trix | SignalType::Mtm | SignalType::MacdHistogram => {
                SignalFamily::ZeroCrossing
            }
            SignalType::BollWidth => SignalFamily::BandWidth,
            SignalType::Boll | SignalType::Ma => SignalFamily::Unmapped,
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalType {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        SignalType::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| BacktestError::invalid(format!("unknown signal type '{}'", trimmed)))
    }
}

/// Threshold rule shared by a group of indicators with the same natural scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFamily {
    /// Readings spanning roughly [-1, 1].
    BoundedOscillator,
    /// Trend and momentum readings where the sign carries the direction.
    ZeroCrossing,
    /// Band contraction readings; buy-only.
    BandWidth,
    /// Weighted in combinations but never traded on directly.
    Unmapped,
}

impl SignalFamily {
    pub fn classify(self, value: f64) -> SignalAction {
        match self {
            SignalFamily::BoundedOscillator => {
                if value > BOUNDED_BUY_THRESHOLD {
                    SignalAction::Buy
                } else if value < BOUNDED_SELL_THRESHOLD {
                    SignalAction::Sell
                } else {
                    SignalAction::Hold
                }
            }
            SignalFamily::ZeroCrossing => {
                if value > 0.0 {
                    SignalAction::Buy
                } else if value < 0.0 {
                    SignalAction::Sell
                } else {
                    SignalAction::Hold
                }
            }
            // A narrow band reads as a pending breakout; wide bands say nothing.
            SignalFamily::BandWidth => {
                if value < BAND_WIDTH_CONTRACTION_THRESHOLD {
                    SignalAction::Buy
                } else {
                    SignalAction::Hold
                }
            }
            SignalFamily::Unmapped => SignalAction::Hold,
        }
    }
}

/// Maps a normalized indicator reading to a trading action.
/// Non-finite readings always hold.
pub fn determine_signal_action(signal_type: SignalType, value: f64) -> SignalAction {
    if !value.is_finite() {
        return SignalAction::Hold;
    }
    signal_type.family().classify(value)
}
