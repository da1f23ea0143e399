//! Pricing request value object.
//!
//! A [`PricingRequest`] describes everything that affects the price of a
//! configurable part. It is immutable once built; editors produce a new
//! request for every change and the engine compares requests field by field.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Manufacturing process. Switching process changes the cost model
/// qualitatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    CncMilling,
    CncTurning,
    SheetMetal,
    InjectionMolding,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::CncMilling => "cnc_milling",
            ProcessType::CncTurning => "cnc_turning",
            ProcessType::SheetMetal => "sheet_metal",
            ProcessType::InjectionMolding => "injection_molding",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a free-form configuration attribute.
///
/// Lists are order-preserving: callers that need set semantics must sort
/// before building the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Flag(bool),
    Number(f64),
    Text(String),
    List(Vec<String>),
}

/// Every field of a request that can differ between two requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestField {
    PartId,
    Process,
    Material,
    Machine,
    Quantity,
    Finishes,
    Tolerance,
    LeadTime,
    Rush,
    Attribute(String),
}

impl RequestField {
    /// Fields whose change alters the cost model qualitatively.
    pub fn is_model_breaking(&self) -> bool {
        matches!(
            self,
            RequestField::PartId
                | RequestField::Process
                | RequestField::Material
                | RequestField::Machine
        )
    }
}

/// Immutable description of a part configuration to be priced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRequest {
    /// Part (geometry revision) being priced.
    pub part_id: String,
    pub process: ProcessType,
    pub material_id: String,
    pub machine_id: String,
    pub quantity: u32,
    /// Finish set. Order is irrelevant.
    #[serde(default)]
    pub finish_ids: Vec<String>,
    #[serde(default)]
    pub tolerance_id: Option<String>,
    #[serde(default)]
    pub lead_time_id: Option<String>,
    #[serde(default)]
    pub is_rush: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl PricingRequest {
    pub fn builder() -> PricingRequestBuilder {
        PricingRequestBuilder::default()
    }

    /// Check required fields and value domains.
    ///
    /// Required fields are never defaulted: an empty `part_id`,
    /// `material_id` or `machine_id` is reported as missing.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("part_id", &self.part_id)?;
        require_text("material_id", &self.material_id)?;
        require_text("machine_id", &self.machine_id)?;

        if self.quantity == 0 {
            return Err(ValidationError::invalid(
                "quantity",
                "must be greater than zero",
            ));
        }

        if self.finish_ids.iter().any(|f| f.trim().is_empty()) {
            return Err(ValidationError::invalid(
                "finish_ids",
                "finish ids must not be empty",
            ));
        }

        for (field, value) in [
            ("tolerance_id", &self.tolerance_id),
            ("lead_time_id", &self.lead_time_id),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(ValidationError::invalid(field, "must be omitted or non-empty"));
            }
        }

        for (name, value) in &self.attributes {
            if name.trim().is_empty() {
                return Err(ValidationError::invalid(
                    "attributes",
                    "attribute names must not be empty",
                ));
            }
            if let AttrValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(ValidationError::invalid(
                        format!("attributes.{}", name),
                        "number must be finite",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Finish ids in canonical (sorted, deduplicated) order.
    pub fn sorted_finishes(&self) -> Vec<&str> {
        let mut finishes: Vec<&str> = self.finish_ids.iter().map(String::as_str).collect();
        finishes.sort_unstable();
        finishes.dedup();
        finishes
    }

    /// Fields whose values differ between `self` and `other`.
    pub fn diff(&self, other: &PricingRequest) -> Vec<RequestField> {
        let mut changed = Vec::new();

        if self.part_id != other.part_id {
            changed.push(RequestField::PartId);
        }
        if self.process != other.process {
            changed.push(RequestField::Process);
        }
        if self.material_id != other.material_id {
            changed.push(RequestField::Material);
        }
        if self.machine_id != other.machine_id {
            changed.push(RequestField::Machine);
        }
        if self.quantity != other.quantity {
            changed.push(RequestField::Quantity);
        }
        if self.sorted_finishes() != other.sorted_finishes() {
            changed.push(RequestField::Finishes);
        }
        if self.tolerance_id != other.tolerance_id {
            changed.push(RequestField::Tolerance);
        }
        if self.lead_time_id != other.lead_time_id {
            changed.push(RequestField::LeadTime);
        }
        if self.is_rush != other.is_rush {
            changed.push(RequestField::Rush);
        }

        let names: std::collections::BTreeSet<&String> = self
            .attributes
            .keys()
            .chain(other.attributes.keys())
            .collect();
        for name in names {
            if self.attributes.get(name) != other.attributes.get(name) {
                changed.push(RequestField::Attribute(name.clone()));
            }
        }

        changed
    }

    /// Copy of this request with a different quantity.
    pub fn with_quantity(&self, quantity: u32) -> Self {
        Self {
            quantity,
            ..self.clone()
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::missing(field))
    } else {
        Ok(())
    }
}

/// Builder for [`PricingRequest`] that reports missing required fields.
#[derive(Debug, Clone, Default)]
pub struct PricingRequestBuilder {
    part_id: Option<String>,
    process: Option<ProcessType>,
    material_id: Option<String>,
    machine_id: Option<String>,
    quantity: Option<u32>,
    finish_ids: Vec<String>,
    tolerance_id: Option<String>,
    lead_time_id: Option<String>,
    is_rush: bool,
    attributes: BTreeMap<String, AttrValue>,
}

impl PricingRequestBuilder {
    pub fn part_id(mut self, part_id: impl Into<String>) -> Self {
        self.part_id = Some(part_id.into());
        self
    }

    pub fn process(mut self, process: ProcessType) -> Self {
        self.process = Some(process);
        self
    }

    pub fn material_id(mut self, material_id: impl Into<String>) -> Self {
        self.material_id = Some(material_id.into());
        self
    }

    pub fn machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn finish(mut self, finish_id: impl Into<String>) -> Self {
        self.finish_ids.push(finish_id.into());
        self
    }

    pub fn tolerance_id(mut self, tolerance_id: impl Into<String>) -> Self {
        self.tolerance_id = Some(tolerance_id.into());
        self
    }

    pub fn lead_time_id(mut self, lead_time_id: impl Into<String>) -> Self {
        self.lead_time_id = Some(lead_time_id.into());
        self
    }

    pub fn rush(mut self, is_rush: bool) -> Self {
        self.is_rush = is_rush;
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Build and validate the request.
    pub fn build(self) -> Result<PricingRequest, ValidationError> {
        let request = PricingRequest {
            part_id: self.part_id.ok_or_else(|| ValidationError::missing("part_id"))?,
            process: self.process.ok_or_else(|| ValidationError::missing("process"))?,
            material_id: self
                .material_id
                .ok_or_else(|| ValidationError::missing("material_id"))?,
            machine_id: self
                .machine_id
                .ok_or_else(|| ValidationError::missing("machine_id"))?,
            quantity: self.quantity.ok_or_else(|| ValidationError::missing("quantity"))?,
            finish_ids: self.finish_ids,
            tolerance_id: self.tolerance_id,
            lead_time_id: self.lead_time_id,
            is_rush: self.is_rush,
            attributes: self.attributes,
        };
        request.validate()?;
        Ok(request)
    }
}
