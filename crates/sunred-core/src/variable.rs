//! The dual-domain circuit unknown.
//!
//! A [`NodeVariable`] represents one scalar circuit quantity (a node voltage
//! or auxiliary variable) in two parallel domains: DC (real) and AC (complex
//! small-signal). Storage is bit-cast atomic so that shared references can be
//! handed to every component that stamps the unknown, including components
//! running on different worker threads.

use num_complex::Complex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free `f64` cell.
///
/// Plain reads/writes use relaxed load/store; the accumulation path offers
/// both a plain (single-writer) and a compare-exchange (multi-writer) add.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add without synchronization. Only valid while a single component
    /// writes this cell.
    pub fn add_plain(&self, value: f64) {
        self.set(self.get() + value);
    }

    /// Add with a compare-exchange loop. Safe under concurrent writers.
    pub fn add_atomic(&self, value: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
    }
}

/// Per-domain accumulation state: value, step-start value, defect and
/// self-admittance accumulators.
#[derive(Debug)]
struct DomainState {
    value: AtomicF64,
    step_start: AtomicF64,
    defect: AtomicF64,
    y_self: AtomicF64,
}

impl DomainState {
    fn new(value: f64) -> Self {
        Self {
            value: AtomicF64::new(value),
            step_start: AtomicF64::new(value),
            defect: AtomicF64::new(0.0),
            y_self: AtomicF64::new(0.0),
        }
    }
}

/// One scalar circuit unknown, carried in the DC (real) and AC (complex)
/// domains simultaneously.
///
/// The concurrency flag is fixed at build time: when more than one component
/// statically writes the same unknown, defect and self-admittance
/// accumulation must take the atomic path, otherwise plain load/store
/// suffices. The flag never changes mid-simulation.
#[derive(Debug)]
pub struct NodeVariable {
    concurrent: bool,
    default_value: f64,
    dc: DomainState,
    ac_re: DomainState,
    ac_im: DomainState,
}

impl NodeVariable {
    /// Create an unknown initialized to `default_value` in the DC domain
    /// (the AC domain starts at zero).
    pub fn new(default_value: f64, concurrent: bool) -> Self {
        Self {
            concurrent,
            default_value,
            dc: DomainState::new(default_value),
            ac_re: DomainState::new(0.0),
            ac_im: DomainState::new(0.0),
        }
    }

    /// Whether accumulation uses the atomic path.
    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// The value assigned when the unknown backs an unconnected terminal.
    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    // --- DC domain -------------------------------------------------------

    pub fn value_dc(&self) -> f64 {
        self.dc.value.get()
    }

    pub fn set_value_dc(&self, v: f64) {
        self.dc.value.set(v);
    }

    pub fn step_start_dc(&self) -> f64 {
        self.dc.step_start.get()
    }

    pub fn set_step_start_dc(&self, v: f64) {
        self.dc.step_start.set(v);
    }

    /// Latch the current DC value as the new step-start value (called when
    /// a transient time step is accepted).
    pub fn accept_step_dc(&self) {
        self.dc.step_start.set(self.dc.value.get());
    }

    pub fn defect_dc(&self) -> f64 {
        self.dc.defect.get()
    }

    pub fn add_defect_dc(&self, v: f64) {
        if self.concurrent {
            self.dc.defect.add_atomic(v);
        } else {
            self.dc.defect.add_plain(v);
        }
    }

    pub fn y_self_dc(&self) -> f64 {
        self.dc.y_self.get()
    }

    pub fn add_y_self_dc(&self, v: f64) {
        if self.concurrent {
            self.dc.y_self.add_atomic(v);
        } else {
            self.dc.y_self.add_plain(v);
        }
    }

    // --- AC domain -------------------------------------------------------

    pub fn value_ac(&self) -> Complex<f64> {
        Complex::new(self.ac_re.value.get(), self.ac_im.value.get())
    }

    pub fn set_value_ac(&self, v: Complex<f64>) {
        self.ac_re.value.set(v.re);
        self.ac_im.value.set(v.im);
    }

    pub fn step_start_ac(&self) -> Complex<f64> {
        Complex::new(self.ac_re.step_start.get(), self.ac_im.step_start.get())
    }

    pub fn set_step_start_ac(&self, v: Complex<f64>) {
        self.ac_re.step_start.set(v.re);
        self.ac_im.step_start.set(v.im);
    }

    pub fn accept_step_ac(&self) {
        self.ac_re.step_start.set(self.ac_re.value.get());
        self.ac_im.step_start.set(self.ac_im.value.get());
    }

    pub fn defect_ac(&self) -> Complex<f64> {
        Complex::new(self.ac_re.defect.get(), self.ac_im.defect.get())
    }

    pub fn add_defect_ac(&self, v: Complex<f64>) {
        if self.concurrent {
            self.ac_re.defect.add_atomic(v.re);
            self.ac_im.defect.add_atomic(v.im);
        } else {
            self.ac_re.defect.add_plain(v.re);
            self.ac_im.defect.add_plain(v.im);
        }
    }

    pub fn y_self_ac(&self) -> Complex<f64> {
        Complex::new(self.ac_re.y_self.get(), self.ac_im.y_self.get())
    }

    pub fn add_y_self_ac(&self, v: Complex<f64>) {
        if self.concurrent {
            self.ac_re.y_self.add_atomic(v.re);
            self.ac_im.y_self.add_atomic(v.im);
        } else {
            self.ac_re.y_self.add_plain(v.re);
            self.ac_im.y_self.add_plain(v.im);
        }
    }

    // --- Pass lifecycle --------------------------------------------------

    /// Clear the defect and self-admittance accumulators in both domains.
    /// Called once at the start of every analysis pass.
    pub fn clear_accumulators(&self) {
        self.dc.defect.set(0.0);
        self.dc.y_self.set(0.0);
        self.ac_re.defect.set(0.0);
        self.ac_im.defect.set(0.0);
        self.ac_re.y_self.set(0.0);
        self.ac_im.y_self.set(0.0);
    }

    /// Reset the value in both domains to the default (DC) and zero (AC).
    pub fn reset_value(&self) {
        self.dc.value.set(self.default_value);
        self.dc.step_start.set(self.default_value);
        self.ac_re.value.set(0.0);
        self.ac_im.value.set(0.0);
        self.ac_re.step_start.set(0.0);
        self.ac_im.step_start.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_value() {
        let var = NodeVariable::new(1.5, false);
        assert_eq!(var.value_dc(), 1.5);
        assert_eq!(var.step_start_dc(), 1.5);
        assert_eq!(var.value_ac(), Complex::new(0.0, 0.0));
        assert!(!var.is_concurrent());
    }

    #[test]
    fn test_defect_accumulation() {
        let var = NodeVariable::new(0.0, false);
        var.add_defect_dc(1.0);
        var.add_defect_dc(2.5);
        assert_eq!(var.defect_dc(), 3.5);

        var.clear_accumulators();
        assert_eq!(var.defect_dc(), 0.0);
    }

    #[test]
    fn test_accept_step() {
        let var = NodeVariable::new(0.0, false);
        var.set_value_dc(2.0);
        assert_eq!(var.step_start_dc(), 0.0);
        var.accept_step_dc();
        assert_eq!(var.step_start_dc(), 2.0);
    }

    #[test]
    fn test_ac_accumulation() {
        let var = NodeVariable::new(0.0, true);
        var.add_defect_ac(Complex::new(1.0, -2.0));
        var.add_defect_ac(Complex::new(0.5, 0.5));
        assert_eq!(var.defect_ac(), Complex::new(1.5, -1.5));
    }

    #[test]
    fn test_concurrent_accumulation_is_exact() {
        let var = NodeVariable::new(0.0, true);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        var.add_defect_dc(1.0);
                    }
                });
            }
        });
        // Integer-valued adds below 2^53 are exact, so the CAS loop must
        // not lose a single update.
        assert_eq!(var.defect_dc(), 4000.0);
    }

    #[test]
    fn test_reset_value() {
        let var = NodeVariable::new(0.25, false);
        var.set_value_dc(9.0);
        var.set_value_ac(Complex::new(1.0, 1.0));
        var.reset_value();
        assert_eq!(var.value_dc(), 0.25);
        assert_eq!(var.value_ac(), Complex::new(0.0, 0.0));
    }
}
