//! Subcircuit composites.
//!
//! A [`SubCircuitModel`] describes a group of contained components over a
//! private unknown arena split into exported (external) and enclosed
//! (internal) unknowns, plus the reducer that eliminates the enclosed
//! ones. A [`SubCircuitInstance`] is the built runtime object: it owns the
//! unknown storage and the selected reducer, and implements [`Stamp`] over
//! its exported unknowns so a parent composite can treat it as an ordinary
//! component one level up.
//!
//! Models live in an explicitly passed [`ModelContext`] catalog; instances
//! cache the model version they were built from and skip the topology
//! rebuild when it has not advanced.

use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;
use std::sync::Arc;
use sunred_core::{DomainScalar, Error, MergePlan, NodeVariable, Result, Stamp, Terminal};

use crate::forest::{LeafSpec, SunredForest};
use crate::full::{FullMatrixReductor, GroupMember};

/// Nesting limit guarding against a model catalog with a reference cycle.
const MAX_NESTING: usize = 64;

/// Which elimination strategy a subcircuit model designates.
#[derive(Debug, Clone)]
pub enum ReducerKind {
    /// Flat Schur complement over the whole group at once.
    FullMatrix,
    /// Tree-structured successive reduction driven by a merge plan.
    Sunred(MergePlan),
}

/// One contained component: a model reference and its terminal wiring.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    pub model: String,
    pub terminals: Vec<Terminal>,
    pub enabled: bool,
}

/// Description of a subcircuit's contents. Every mutation bumps the
/// version counter, which built instances compare against to decide
/// whether a topology rebuild is needed.
#[derive(Debug, Clone)]
pub struct SubCircuitModel {
    num_external: usize,
    num_internal: usize,
    components: Vec<ComponentDef>,
    reducer: ReducerKind,
    default_value: f64,
    version: u64,
}

impl SubCircuitModel {
    pub fn new(num_external: usize, num_internal: usize, reducer: ReducerKind) -> Self {
        Self {
            num_external,
            num_internal,
            components: Vec::new(),
            reducer,
            default_value: 0.0,
            version: 1,
        }
    }

    /// Add a contained component; returns its index within the model.
    pub fn add_component(&mut self, model: impl Into<String>, terminals: Vec<Terminal>) -> usize {
        self.components.push(ComponentDef {
            model: model.into(),
            terminals,
            enabled: true,
        });
        self.version += 1;
        self.components.len() - 1
    }

    pub fn set_enabled(&mut self, component: usize, enabled: bool) -> Result<()> {
        let def = self
            .components
            .get_mut(component)
            .ok_or(Error::IndexNotFound { index: component })?;
        def.enabled = enabled;
        self.version += 1;
        Ok(())
    }

    pub fn set_reducer(&mut self, reducer: ReducerKind) {
        self.reducer = reducer;
        self.version += 1;
    }

    /// Starting value for every unknown the instance allocates, padding
    /// included.
    pub fn set_default_value(&mut self, v: f64) {
        self.default_value = v;
        self.version += 1;
    }

    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    pub fn num_external(&self) -> usize {
        self.num_external
    }

    pub fn num_internal(&self) -> usize {
        self.num_internal
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Catalog of element stamps and subcircuit models, passed explicitly to
/// every build. Replacing an entry is how a model mutation becomes visible
/// to already-built instances.
pub struct ModelContext<T: DomainScalar> {
    elements: HashMap<String, Arc<dyn Stamp<T>>>,
    subcircuits: HashMap<String, Arc<SubCircuitModel>>,
}

impl<T: DomainScalar> Default for ModelContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DomainScalar> ModelContext<T> {
    pub fn new() -> Self {
        Self {
            elements: HashMap::new(),
            subcircuits: HashMap::new(),
        }
    }

    pub fn add_element(&mut self, name: impl Into<String>, stamp: impl Stamp<T> + 'static) {
        self.elements.insert(name.into(), Arc::new(stamp));
    }

    pub fn add_subcircuit(&mut self, name: impl Into<String>, model: SubCircuitModel) {
        self.subcircuits.insert(name.into(), Arc::new(model));
    }

    pub fn element(&self, name: &str) -> Result<&Arc<dyn Stamp<T>>> {
        self.elements
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn subcircuit(&self, name: &str) -> Result<&Arc<SubCircuitModel>> {
        self.subcircuits
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }
}

enum ComponentInstance<T: DomainScalar> {
    Element(Arc<dyn Stamp<T>>),
    Sub(Box<SubCircuitInstance<T>>),
}

impl<T: DomainScalar> ComponentInstance<T> {
    fn as_stamp(&self) -> &dyn Stamp<T> {
        match self {
            ComponentInstance::Element(stamp) => stamp.as_ref(),
            ComponentInstance::Sub(sub) => sub.as_ref(),
        }
    }
}

enum Reducer<T: DomainScalar> {
    Full(FullMatrixReductor<T>),
    Forest(SunredForest<T>),
}

impl<T: DomainScalar> Reducer<T> {
    /// Reduced admittance entry addressed by this group's global unknown
    /// indices; zero when an index did not survive the reduction.
    ///
    /// The composite always partitions its Full reducer as `0..n_ext` in
    /// order, so the exported index is the block position.
    fn y_at(&self, row: usize, col: usize) -> T {
        match self {
            Reducer::Full(r) => {
                let n = r.a_indices().len();
                if row < n && col < n {
                    r.reduced_y()[(row, col)]
                } else {
                    T::zero()
                }
            }
            Reducer::Forest(f) => f.reduced_entry(row, col),
        }
    }

    fn j_at(&self, row: usize) -> T {
        match self {
            Reducer::Full(r) => {
                if row < r.a_indices().len() {
                    r.reduced_j()[row]
                } else {
                    T::zero()
                }
            }
            Reducer::Forest(f) => f.reduced_defect_entry(row),
        }
    }
}

/// A built subcircuit: unknown storage, instantiated contents and the
/// designated reducer. Unknown arena layout is externals first, then
/// declared internals, then one padding unknown per unconnected terminal.
pub struct SubCircuitInstance<T: DomainScalar> {
    model_name: String,
    built_version: Option<u64>,
    num_external: usize,
    num_internal: usize,
    num_unknowns: usize,
    vars: Vec<NodeVariable>,
    comps: Vec<ComponentInstance<T>>,
    connections: Vec<Vec<Option<usize>>>,
    reducer: Option<Reducer<T>>,
}

impl<T: DomainScalar> SubCircuitInstance<T> {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            built_version: None,
            num_external: 0,
            num_internal: 0,
            num_unknowns: 0,
            vars: Vec::new(),
            comps: Vec::new(),
            connections: Vec::new(),
            reducer: None,
        }
    }

    /// Build or refresh this instance from its model in the catalog.
    ///
    /// When the cached version matches the model's current one, the
    /// topology is kept as-is and only nested subcircuits are recursed
    /// into; otherwise connectivity is re-resolved, contents
    /// re-instantiated and the reducer re-allocated.
    pub fn build(&mut self, ctx: &ModelContext<T>) -> Result<()> {
        self.build_at(ctx, 0)
    }

    fn build_at(&mut self, ctx: &ModelContext<T>, depth: usize) -> Result<()> {
        if depth >= MAX_NESTING {
            return Err(Error::InvalidGroup(format!(
                "subcircuit nesting exceeds {MAX_NESTING} levels (model cycle?)"
            )));
        }
        let model = ctx.subcircuit(&self.model_name)?.clone();
        if self.built_version == Some(model.version) {
            for comp in &mut self.comps {
                if let ComponentInstance::Sub(sub) = comp {
                    sub.build_at(ctx, depth + 1)?;
                }
            }
            return Ok(());
        }

        let (n_ext, n_int) = (model.num_external, model.num_internal);
        let mut next_pad = n_ext + n_int;
        let mut comps = Vec::with_capacity(model.components.len());
        let mut connections = Vec::with_capacity(model.components.len());
        let mut enabled = Vec::with_capacity(model.components.len());

        for def in &model.components {
            let inst = if let Some(stamp) = ctx.elements.get(&def.model) {
                ComponentInstance::Element(stamp.clone())
            } else if ctx.subcircuits.contains_key(&def.model) {
                let mut sub = SubCircuitInstance::new(def.model.clone());
                sub.build_at(ctx, depth + 1)?;
                ComponentInstance::Sub(Box::new(sub))
            } else {
                return Err(Error::ModelNotFound(def.model.clone()));
            };

            let declared = inst.as_stamp().num_terminals();
            if declared != def.terminals.len() {
                return Err(Error::TerminalCountMismatch {
                    name: def.model.clone(),
                    declared,
                    actual: def.terminals.len(),
                });
            }

            let mut conns = Vec::with_capacity(def.terminals.len());
            for &t in &def.terminals {
                conns.push(match t {
                    Terminal::External(i) => {
                        if i >= n_ext {
                            return Err(Error::UnknownOutOfRange {
                                index: i,
                                count: n_ext,
                            });
                        }
                        Some(i)
                    }
                    Terminal::Internal(i) => {
                        if i >= n_int {
                            return Err(Error::UnknownOutOfRange {
                                index: i,
                                count: n_int,
                            });
                        }
                        Some(n_ext + i)
                    }
                    Terminal::Ground => None,
                    Terminal::Unconnected => {
                        let pad = next_pad;
                        next_pad += 1;
                        Some(pad)
                    }
                });
            }
            comps.push(inst);
            connections.push(conns);
            enabled.push(def.enabled);
        }

        let total = next_pad;

        // Atomic defect accumulation only where more than one component
        // can write the same unknown; fixed at build time.
        let mut writers = vec![0u32; total];
        for (conns, &en) in connections.iter().zip(&enabled) {
            if en {
                for &g in conns.iter().flatten() {
                    writers[g] += 1;
                }
            }
        }
        let vars: Vec<NodeVariable> = writers
            .iter()
            .map(|&w| NodeVariable::new(model.default_value, w > 1))
            .collect();

        let reducer = match &model.reducer {
            ReducerKind::FullMatrix => {
                let members: Vec<GroupMember> = connections
                    .iter()
                    .zip(&enabled)
                    .map(|(c, &en)| GroupMember {
                        connections: c.clone(),
                        enabled: en,
                    })
                    .collect();
                Reducer::Full(FullMatrixReductor::new(
                    (0..n_ext).collect(),
                    (n_ext..total).collect(),
                    &members,
                )?)
            }
            ReducerKind::Sunred(plan) => {
                let leaves: Vec<LeafSpec> = connections
                    .iter()
                    .zip(&enabled)
                    .map(|(c, &en)| LeafSpec {
                        connections: c.clone(),
                        enabled: en,
                    })
                    .collect();
                let mut external = vec![false; total];
                external[..n_ext].fill(true);
                Reducer::Forest(SunredForest::build(&leaves, plan, total, &external)?)
            }
        };

        self.num_external = n_ext;
        self.num_internal = n_int;
        self.num_unknowns = total;
        self.vars = vars;
        self.comps = comps;
        self.connections = connections;
        self.reducer = Some(reducer);
        self.built_version = Some(model.version);
        Ok(())
    }

    /// Reduce: nested subcircuits first, then this group's own reducer.
    pub fn forwsubs(&mut self) -> Result<()> {
        for comp in &mut self.comps {
            if let ComponentInstance::Sub(sub) = comp {
                sub.forwsubs()?;
            }
        }
        let stamps: Vec<&dyn Stamp<T>> = self.comps.iter().map(|c| c.as_stamp()).collect();
        match self.reducer.as_mut() {
            Some(Reducer::Full(r)) => r.forward(&stamps, &self.vars),
            Some(Reducer::Forest(f)) => f.forward(&stamps, &self.vars),
            None => Err(Error::InvalidGroup(
                "subcircuit used before build".to_string(),
            )),
        }
    }

    /// Substitute: write the exported unknowns' known values, recover this
    /// group's eliminated unknowns, then descend into nested subcircuits
    /// whose boundary values are now all determined.
    pub fn backsubs(&mut self, boundary: &[T]) -> Result<()> {
        if boundary.len() != self.num_external {
            return Err(Error::InvalidGroup(format!(
                "boundary carries {} values for {} exported unknowns",
                boundary.len(),
                self.num_external
            )));
        }
        for (var, &v) in self.vars.iter().zip(boundary) {
            T::write_value(var, v);
        }
        match &self.reducer {
            Some(Reducer::Full(r)) => r.backward(&self.vars)?,
            Some(Reducer::Forest(f)) => f.backward(&self.vars)?,
            None => {
                return Err(Error::InvalidGroup(
                    "subcircuit used before build".to_string(),
                ))
            }
        }
        for (ci, comp) in self.comps.iter_mut().enumerate() {
            if let ComponentInstance::Sub(sub) = comp {
                let child_boundary: Vec<T> = self.connections[ci]
                    .iter()
                    .map(|conn| match conn {
                        Some(g) => T::read_value(&self.vars[*g]),
                        None => T::zero(),
                    })
                    .collect();
                sub.backsubs(&child_boundary)?;
            }
        }
        Ok(())
    }

    /// Reduce, solve the surviving system over the exported unknowns with
    /// a dense LU, and substitute back down. Intended for driving a
    /// top-level circuit; a nested instance is driven by its parent
    /// through `forwsubs`/`backsubs` instead.
    pub fn solve(&mut self) -> Result<()> {
        self.forwsubs()?;
        let n = self.num_external;
        // A top-level circuit exports nothing; there is no reduced system
        // left to solve.
        if n == 0 {
            return self.backsubs(&[]);
        }
        let (mut y, mut j) = (DMatrix::<T>::zeros(n, n), DVector::<T>::zeros(n));
        if let Some(reducer) = &self.reducer {
            for r in 0..n {
                j[r] = reducer.j_at(r);
                for c in 0..n {
                    y[(r, c)] = reducer.y_at(r, c);
                }
            }
        }
        let rhs = -j;
        let ua = y
            .lu()
            .solve(&rhs)
            .ok_or_else(|| Error::InvalidGroup("reduced system is singular".to_string()))?;
        let boundary: Vec<T> = ua.iter().copied().collect();
        self.backsubs(&boundary)
    }

    pub fn num_external(&self) -> usize {
        self.num_external
    }

    pub fn num_internal(&self) -> usize {
        self.num_internal
    }

    /// Total unknown count including padding for unconnected terminals.
    pub fn num_unknowns(&self) -> usize {
        self.num_unknowns
    }

    /// The instance's unknown storage, externals first.
    pub fn vars(&self) -> &[NodeVariable] {
        &self.vars
    }

    pub fn external_value(&self, i: usize) -> Result<T> {
        if i >= self.num_external {
            return Err(Error::UnknownOutOfRange {
                index: i,
                count: self.num_external,
            });
        }
        Ok(T::read_value(&self.vars[i]))
    }

    pub fn internal_value(&self, i: usize) -> Result<T> {
        if i >= self.num_internal {
            return Err(Error::UnknownOutOfRange {
                index: i,
                count: self.num_internal,
            });
        }
        Ok(T::read_value(&self.vars[self.num_external + i]))
    }

    /// The nested instance built for component `i`, if that component is a
    /// subcircuit.
    pub fn subcircuit_at(&self, i: usize) -> Option<&SubCircuitInstance<T>> {
        match self.comps.get(i) {
            Some(ComponentInstance::Sub(sub)) => Some(sub),
            _ => None,
        }
    }
}

impl<T: DomainScalar> Stamp<T> for SubCircuitInstance<T> {
    fn num_terminals(&self) -> usize {
        self.num_external
    }

    fn y(&self, row: usize, col: usize) -> T {
        self.reducer
            .as_ref()
            .map_or_else(T::zero, |r| r.y_at(row, col))
    }

    fn j_reduced(&self, row: usize) -> T {
        self.reducer.as_ref().map_or_else(T::zero, |r| r.j_at(row))
    }

    fn is_symmetric(&self) -> bool {
        match &self.reducer {
            Some(Reducer::Full(r)) => r.is_symmetric(),
            Some(Reducer::Forest(f)) => f.roots_symmetric(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sunred_core::DenseStamp;

    fn injected_conductance(g: f64, j0: f64) -> DenseStamp<f64> {
        let mut s = DenseStamp::conductance(g);
        s.j[0] = j0;
        s
    }

    #[test]
    fn test_flat_subcircuit_solves_divider() {
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("r1", injected_conductance(2.0, -1.0));
        ctx.add_element("r2", DenseStamp::conductance(3.0));

        let mut model = SubCircuitModel::new(0, 2, ReducerKind::FullMatrix);
        model.add_component("r1", vec![Terminal::Internal(0), Terminal::Internal(1)]);
        model.add_component("r2", vec![Terminal::Internal(1), Terminal::Ground]);
        ctx.add_subcircuit("divider", model);

        let mut inst = SubCircuitInstance::new("divider");
        inst.build(&ctx).unwrap();
        inst.solve().unwrap();

        // 1 A into node 0 through g=2 and g=3 in series to ground.
        assert!((inst.internal_value(0).unwrap() - 5.0 / 6.0).abs() < 1e-12);
        assert!((inst.internal_value(1).unwrap() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_version_skip_keeps_state_and_rebuild_resets() {
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("r", DenseStamp::<f64>::conductance(1.0));
        let mut model = SubCircuitModel::new(1, 0, ReducerKind::FullMatrix);
        model.add_component("r", vec![Terminal::External(0), Terminal::Ground]);
        ctx.add_subcircuit("shunt", model.clone());

        let mut inst = SubCircuitInstance::<f64>::new("shunt");
        inst.build(&ctx).unwrap();
        inst.vars()[0].add_defect_dc(-0.5);

        // Same version: topology untouched, accumulated state survives.
        inst.build(&ctx).unwrap();
        assert_eq!(inst.vars()[0].defect_dc(), -0.5);

        // Bumped version: unknown storage is re-allocated.
        model.set_enabled(0, false).unwrap();
        ctx.add_subcircuit("shunt", model);
        inst.build(&ctx).unwrap();
        assert_eq!(inst.vars()[0].defect_dc(), 0.0);
    }

    #[test]
    fn test_nested_subcircuit_acts_as_stamp() {
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("r2", DenseStamp::<f64>::conductance(2.0));
        ctx.add_element("load", DenseStamp::<f64>::conductance(1.0));
        ctx.add_element(
            "src",
            DenseStamp::<f64>::new(
                DMatrix::zeros(1, 1),
                DVector::from_element(1, -1.0),
                true,
            )
            .unwrap(),
        );

        // Two g=2 in series through a private mid node: reduced to a g=1
        // two-terminal block.
        let mut inner = SubCircuitModel::new(2, 1, ReducerKind::FullMatrix);
        inner.add_component("r2", vec![Terminal::External(0), Terminal::Internal(0)]);
        inner.add_component("r2", vec![Terminal::Internal(0), Terminal::External(1)]);
        ctx.add_subcircuit("series", inner);

        let mut outer = SubCircuitModel::new(0, 2, ReducerKind::FullMatrix);
        outer.add_component("src", vec![Terminal::Internal(0)]);
        outer.add_component("series", vec![Terminal::Internal(0), Terminal::Internal(1)]);
        outer.add_component("load", vec![Terminal::Internal(1), Terminal::Ground]);
        ctx.add_subcircuit("top", outer);

        let mut inst = SubCircuitInstance::new("top");
        inst.build(&ctx).unwrap();
        inst.solve().unwrap();

        // 1 A through 1 S in series with 1 S: 2 V at the injection node,
        // 1 V behind the series block, 1.5 V at its private mid node.
        assert!((inst.internal_value(0).unwrap() - 2.0).abs() < 1e-12);
        assert!((inst.internal_value(1).unwrap() - 1.0).abs() < 1e-12);
        let series = inst.subcircuit_at(1).unwrap();
        assert!((series.internal_value(0).unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_tree_subcircuit_with_multiple_roots_exports_stamp() {
        // An empty merge plan over two independent shunts is a valid
        // forest with two roots; the exported block must still carry both
        // conductances.
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("g2", DenseStamp::<f64>::conductance(2.0));
        ctx.add_element("g3", DenseStamp::<f64>::conductance(3.0));

        let mut model = SubCircuitModel::new(2, 0, ReducerKind::Sunred(MergePlan::default()));
        model.add_component("g2", vec![Terminal::External(0), Terminal::Ground]);
        model.add_component("g3", vec![Terminal::External(1), Terminal::Ground]);
        ctx.add_subcircuit("shunts", model);

        let mut inst = SubCircuitInstance::new("shunts");
        inst.build(&ctx).unwrap();
        inst.forwsubs().unwrap();

        assert_eq!(inst.y(0, 0), 2.0);
        assert_eq!(inst.y(1, 1), 3.0);
        assert_eq!(inst.y(0, 1), 0.0);
        assert!(Stamp::is_symmetric(&inst));
    }

    #[test]
    fn test_unconnected_terminal_gets_padding_unknown() {
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("r", DenseStamp::<f64>::conductance(1.0));
        let mut model = SubCircuitModel::new(1, 0, ReducerKind::FullMatrix);
        model.add_component("r", vec![Terminal::External(0), Terminal::Unconnected]);
        ctx.add_subcircuit("dangling", model);

        let mut inst = SubCircuitInstance::<f64>::new("dangling");
        inst.build(&ctx).unwrap();
        assert_eq!(inst.num_unknowns(), 2);
        // The padded node floats; the near-singular block is clamped, not
        // raised.
        inst.forwsubs().unwrap();
    }

    #[test]
    fn test_model_default_value_seeds_unknowns() {
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("r", DenseStamp::<f64>::conductance(1.0));
        let mut model = SubCircuitModel::new(1, 0, ReducerKind::FullMatrix);
        model.add_component("r", vec![Terminal::External(0), Terminal::Unconnected]);
        model.set_default_value(1.5);
        ctx.add_subcircuit("seeded", model);

        let mut inst = SubCircuitInstance::<f64>::new("seeded");
        inst.build(&ctx).unwrap();
        for var in inst.vars() {
            assert_eq!(var.default_value(), 1.5);
            assert_eq!(var.value_dc(), 1.5);
        }
    }

    #[test]
    fn test_terminal_count_mismatch_is_fatal_at_build() {
        let mut ctx = ModelContext::<f64>::new();
        ctx.add_element("r", DenseStamp::<f64>::conductance(1.0));
        let mut model = SubCircuitModel::new(1, 0, ReducerKind::FullMatrix);
        model.add_component("r", vec![Terminal::External(0)]);
        ctx.add_subcircuit("bad", model);

        let mut inst = SubCircuitInstance::<f64>::new("bad");
        assert!(matches!(
            inst.build(&ctx),
            Err(Error::TerminalCountMismatch {
                declared: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_model_is_fatal_at_build() {
        let mut ctx = ModelContext::<f64>::new();
        let mut model = SubCircuitModel::new(0, 1, ReducerKind::FullMatrix);
        model.add_component("nope", vec![Terminal::Internal(0)]);
        ctx.add_subcircuit("broken", model);

        let mut inst = SubCircuitInstance::<f64>::new("broken");
        assert!(matches!(
            inst.build(&ctx),
            Err(Error::ModelNotFound(name)) if name == "nope"
        ));
    }
}
