//! Closed set of primitive, vector and pointer descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::diagnostics::{InternalError, Result};

/// Scalar lane type of a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Element {
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl Element {
    pub fn kind(self) -> Kind {
        match self {
            Element::I8 => Kind::I8,
            Element::I16 => Kind::I16,
            Element::I32 => Kind::I32,
            Element::I64 => Kind::I64,
            Element::F16 => Kind::F16,
            Element::F32 => Kind::F32,
            Element::F64 => Kind::F64,
        }
    }
}

/// Target type descriptor
///
/// `Ptr` is a raw 64-bit device address. It shares its declaration with `I64`
/// and only becomes a typed pointer at a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
    Ptr,
    Vector { element: Element, lanes: u8 },
}

/// Lane counts the target accepts
pub const VECTOR_LANES: [u8; 5] = [2, 3, 4, 8, 16];

impl Kind {
    /// Build a vector kind, rejecting lane counts the target cannot declare
    pub fn vector(element: Element, lanes: u8) -> Result<Kind> {
        if !VECTOR_LANES.contains(&lanes) {
            return Err(InternalError::UnsupportedKind(format!(
                "{}{} vector",
                element.kind(),
                lanes
            ))
            .into());
        }
        Ok(Kind::Vector { element, lanes })
    }

    /// Byte size
    pub fn size(self) -> u32 {
        match self {
            Kind::Void => 0,
            Kind::Bool | Kind::I8 => 1,
            Kind::I16 | Kind::F16 => 2,
            Kind::I32 | Kind::F32 => 4,
            Kind::I64 | Kind::F64 | Kind::Ptr => 8,
            Kind::Vector { element, lanes } => element.kind().size() * lanes as u32,
        }
    }

    pub fn bits(self) -> u32 {
        self.size() * 8
    }

    /// Vector length, 1 for scalars
    pub fn lanes(self) -> u32 {
        match self {
            Kind::Vector { lanes, .. } => lanes as u32,
            _ => 1,
        }
    }

    /// Element kind, `self` for scalars
    pub fn element(self) -> Kind {
        match self {
            Kind::Vector { element, .. } => element.kind(),
            other => other,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self.element(),
            Kind::I8 | Kind::I16 | Kind::I32 | Kind::I64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self.element(), Kind::F16 | Kind::F32 | Kind::F64)
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Kind::Vector { .. })
    }

    pub fn is_pointer(self) -> bool {
        matches!(self, Kind::Ptr)
    }

    pub fn is_bool(self) -> bool {
        matches!(self, Kind::Bool)
    }

    /// Integer-like for arithmetic purposes (integers and raw addresses)
    pub fn is_integral(self) -> bool {
        self.is_integer() || self.is_pointer()
    }

    /// Same shape with a different lane type
    pub fn with_element(self, element: Kind) -> Result<Kind> {
        match self {
            Kind::Vector { lanes, .. } => Kind::vector(element.as_element()?, lanes),
            _ => Ok(element),
        }
    }

    pub fn as_element(self) -> Result<Element> {
        match self {
            Kind::I8 => Ok(Element::I8),
            Kind::I16 => Ok(Element::I16),
            Kind::I32 => Ok(Element::I32),
            Kind::I64 | Kind::Ptr => Ok(Element::I64),
            Kind::F16 => Ok(Element::F16),
            Kind::F32 => Ok(Element::F32),
            Kind::F64 => Ok(Element::F64),
            other => Err(InternalError::UnsupportedKind(format!("{} vector lane", other)).into()),
        }
    }

    /// Kind used when the value lives in memory; booleans are stored as bytes
    pub fn storage(self) -> Kind {
        match self {
            Kind::Bool => Kind::I8,
            other => other,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Void => write!(f, "void"),
            Kind::Bool => write!(f, "bool"),
            Kind::I8 => write!(f, "char"),
            Kind::I16 => write!(f, "short"),
            Kind::I32 => write!(f, "int"),
            Kind::I64 => write!(f, "long"),
            Kind::F16 => write!(f, "half"),
            Kind::F32 => write!(f, "float"),
            Kind::F64 => write!(f, "double"),
            Kind::Ptr => write!(f, "ptr"),
            Kind::Vector { element, lanes } => write!(f, "{}{}", element.kind(), lanes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sizes() {
        assert_eq!(Kind::Void.size(), 0);
        assert_eq!(Kind::Bool.size(), 1);
        assert_eq!(Kind::I16.size(), 2);
        assert_eq!(Kind::F32.size(), 4);
        assert_eq!(Kind::Ptr.size(), 8);
        for lanes in VECTOR_LANES {
            let v = Kind::vector(Element::F32, lanes).unwrap();
            assert_eq!(v.size(), v.element().size() * v.lanes());
        }
    }

    #[test]
    fn test_kind_classification() {
        let int4 = Kind::vector(Element::I32, 4).unwrap();
        assert!(int4.is_vector());
        assert!(int4.is_integer());
        assert!(!int4.is_float());
        assert_eq!(int4.element(), Kind::I32);

        assert!(Kind::F16.is_float());
        assert!(Kind::Ptr.is_pointer());
        assert!(Kind::Ptr.is_integral());
        assert!(!Kind::Ptr.is_integer());
        assert_eq!(Kind::Bool.storage(), Kind::I8);
    }

    #[test]
    fn test_bad_lane_count() {
        assert!(Kind::vector(Element::F32, 5).is_err());
        assert!(Kind::vector(Element::F32, 1).is_err());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::F64.to_string(), "double");
        assert_eq!(Kind::vector(Element::F16, 8).unwrap().to_string(), "half8");
    }
}
