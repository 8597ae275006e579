use super::{FieldSolver, GridDims, GridPoint, SolverError};

const TIME_STEP: f64 = 0.001;

/// Solver that only keeps time.
///
/// Field snapshots are zero-filled but correctly sized, so the protocol path
/// carries full-size frames without paying for the numerics.
#[derive(Debug, Default)]
pub struct Headless {
    dims: Option<GridDims>,
    time: f64,
    sources: u64,
}

impl Headless {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources injected since the last initialize.
    pub fn sources(&self) -> u64 {
        self.sources
    }

    fn zero_field(&self, out: &mut Vec<f32>) {
        out.clear();
        if let Some(dims) = self.dims {
            out.resize(dims.components(), 0.0);
        }
    }
}

impl FieldSolver for Headless {
    fn initialize(&mut self, dims: GridDims) -> Result<(), SolverError> {
        self.dims = Some(dims);
        self.time = 0.0;
        self.sources = 0;
        Ok(())
    }

    fn step(&mut self) {
        if self.dims.is_some() {
            self.time += TIME_STEP;
        }
    }

    fn add_source(&mut self, _at: GridPoint, _value: f32) {
        if self.dims.is_some() {
            self.sources += 1;
        }
    }

    fn electric_field(&self, out: &mut Vec<f32>) {
        self.zero_field(out);
    }

    fn magnetic_field(&self, out: &mut Vec<f32>) {
        self.zero_field(out);
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn cleanup(&mut self) {
        self.dims = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_reports_sized_zero_fields() {
        let dims = GridDims::new(2, 3, 4).unwrap();
        let mut solver = Headless::new();
        solver.initialize(dims).unwrap();

        let mut field = vec![7.0; 3];
        solver.magnetic_field(&mut field);
        assert_eq!(field.len(), 2 * 3 * 4 * 3);
        assert!(field.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_headless_counts_sources_and_time() {
        let dims = GridDims::cube(2).unwrap();
        let mut solver = Headless::new();
        solver.initialize(dims).unwrap();
        solver.add_source(GridPoint { x: 1, y: 1, z: 1 }, 1.0);
        solver.step();
        solver.step();

        assert_eq!(solver.sources(), 1);
        assert!((solver.time() - 2.0 * TIME_STEP).abs() < 1e-12);
    }

    #[test]
    fn test_headless_after_cleanup_is_empty() {
        let mut solver = Headless::new();
        solver.initialize(GridDims::cube(2).unwrap()).unwrap();
        solver.cleanup();
        let mut field = Vec::new();
        solver.electric_field(&mut field);
        assert!(field.is_empty());
    }
}
