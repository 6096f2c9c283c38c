//! Hinge loss for the binary object/background decision

use crate::config::LossConfig;
use crate::Float;
use serde::{Deserialize, Serialize};

/// Sample label; implied by which corpus a crop comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Positive,
    Negative,
}

impl Label {
    /// +1 or -1
    #[inline]
    pub fn sign(self) -> Float {
        match self {
            Label::Positive => 1.0,
            Label::Negative => -1.0,
        }
    }
}

/// `max(0, margin - y·s)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HingeLoss {
    pub margin: Float,
}

impl HingeLoss {
    pub fn new(margin: Float) -> Self {
        Self { margin }
    }

    #[inline]
    pub fn value(&self, score: Float, label: Label) -> Float {
        (self.margin - label.sign() * score).max(0.0)
    }

    /// dL/ds: `-y` while the margin is violated, else 0
    #[inline]
    pub fn grad(&self, score: Float, label: Label) -> Float {
        if self.margin - label.sign() * score > 0.0 {
            -label.sign()
        } else {
            0.0
        }
    }

    /// Misclassified, counting a zero score as wrong
    #[inline]
    pub fn is_error(&self, score: Float, label: Label) -> bool {
        label.sign() * score <= 0.0
    }
}

impl From<&LossConfig> for HingeLoss {
    fn from(config: &LossConfig) -> Self {
        Self::new(config.margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hinge_value() {
        let h = HingeLoss::new(1.0);
        assert_relative_eq!(h.value(0.0, Label::Positive), 1.0);
        assert_relative_eq!(h.value(0.0, Label::Negative), 1.0);
        assert_relative_eq!(h.value(0.25, Label::Positive), 0.75);
        assert_relative_eq!(h.value(0.25, Label::Negative), 1.25);
        assert_relative_eq!(h.value(3.0, Label::Positive), 0.0);
        assert_relative_eq!(h.value(-3.0, Label::Negative), 0.0);
    }

    #[test]
    fn test_hinge_grad() {
        let h = HingeLoss::new(1.0);
        assert_eq!(h.grad(0.5, Label::Positive), -1.0);
        assert_eq!(h.grad(0.5, Label::Negative), 1.0);
        assert_eq!(h.grad(1.5, Label::Positive), 0.0);
        // Exactly on the margin: inactive
        assert_eq!(h.grad(1.0, Label::Positive), 0.0);
    }

    #[test]
    fn test_is_error() {
        let h = HingeLoss::new(1.0);
        assert!(h.is_error(0.0, Label::Positive));
        assert!(h.is_error(0.0, Label::Negative));
        assert!(h.is_error(-0.1, Label::Positive));
        assert!(!h.is_error(0.1, Label::Positive));
        assert!(!h.is_error(-0.1, Label::Negative));
    }

    #[test]
    fn test_from_config() {
        let h = HingeLoss::from(&LossConfig { margin: 2.0 });
        assert_relative_eq!(h.value(0.0, Label::Negative), 2.0);
    }
}
