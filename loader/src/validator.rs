// Validator adapter
//
// Presents the static (and, if present, dynamic) text slabs to an
// external code validator and records one of three verdicts. The
// actual validation algorithm is out of scope here -- this module only
// defines the adapter boundary and the verdict bookkeeping, plus a
// handful of stand-in validators used by tests and by `-s` (skip).

use log::info;

use crate::error::LoaderError;

const LOG_TARGET: &str = "validator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationVerdict {
    Pass = 0,
    Fail = 1,
    Skip = 2,
}

/// A text slab presented to the validator: a sandbox-relative address
/// range and the bytes currently occupying it.
pub struct TextSlab<'a> {
    pub start: usize,
    pub end: usize,
    pub bytes: &'a [u8],
}

/// The external validation oracle. Implementations decide, slab by
/// slab, whether the code inside is safe to execute untrusted.
pub trait CodeValidator {
    fn validate(&self, slab: &TextSlab, entry_pt: usize) -> ValidationVerdict;
}

/// Accepts every slab unconditionally. Used by tests that only care
/// about load mechanics, not validation.
pub struct NullValidator;

impl CodeValidator for NullValidator {
    fn validate(&self, _slab: &TextSlab, _entry_pt: usize) -> ValidationVerdict {
        ValidationVerdict::Pass
    }
}

/// Rejects every slab. Used to exercise the `bad-text` failure path.
pub struct RejectingValidator;

impl CodeValidator for RejectingValidator {
    fn validate(&self, _slab: &TextSlab, _entry_pt: usize) -> ValidationVerdict {
        ValidationVerdict::Fail
    }
}

/// Always reports `Skip` without inspecting the slab, backing `-s`.
pub struct SkippingValidator;

impl CodeValidator for SkippingValidator {
    fn validate(&self, _slab: &TextSlab, _entry_pt: usize) -> ValidationVerdict {
        ValidationVerdict::Skip
    }
}

/// Runs `validator` over the static slab and, if present, the dynamic
/// slab, in that order. Returns the first non-`Pass` verdict, or
/// `Pass` if every slab passed; a `Skip` on any slab short-circuits
/// the rest, matching "validation was skipped by request" being an
/// all-or-nothing flag rather than a per-slab choice.
pub fn validate_text(
    validator: &dyn CodeValidator,
    static_slab: &TextSlab,
    dynamic_slab: Option<&TextSlab>,
    entry_pt: usize,
) -> Result<ValidationVerdict, LoaderError> {
    let static_verdict = validator.validate(static_slab, entry_pt);
    if static_verdict == ValidationVerdict::Skip {
        info!(target: LOG_TARGET, "validation skipped by request");
        return Ok(ValidationVerdict::Skip);
    }
    if static_verdict == ValidationVerdict::Fail {
        return Err(LoaderError::BadText("static text slab failed validation".into()));
    }

    if let Some(slab) = dynamic_slab {
        let dynamic_verdict = validator.validate(slab, entry_pt);
        if dynamic_verdict == ValidationVerdict::Fail {
            return Err(LoaderError::BadText("dynamic text slab failed validation".into()));
        }
    }

    info!(target: LOG_TARGET, "validation passed");
    Ok(ValidationVerdict::Pass)
}
