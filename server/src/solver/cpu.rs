use super::{try_zeroed, FieldSolver, GridDims, GridPoint, SolverError, COMPONENTS};

/// Simulation time advanced per step, in seconds.
const TIME_STEP: f64 = 0.001;
/// Update coefficient for both curl equations, below the 3-D stability limit
/// of 1/sqrt(3).
const COURANT: f32 = 0.5;
/// Fraction of the source field kept after each step.
const SOURCE_DECAY: f32 = 0.9;
/// Radius in cells of the sphere painted by `add_source`.
const SOURCE_RADIUS: i64 = 2;

/// Flat vector field storage: three `f32` components per cell.
#[derive(Debug, Default)]
struct FieldBuffer(Vec<f32>);

impl FieldBuffer {
    fn zeroed(dims: GridDims) -> Result<Self, SolverError> {
        try_zeroed(dims.components()).map(FieldBuffer)
    }
}

/// Axis offsets within a flattened field.
#[derive(Debug, Clone, Copy)]
struct Strides {
    x: usize,
    y: usize,
    z: usize,
}

impl Strides {
    fn new(dims: GridDims) -> Self {
        let x = COMPONENTS;
        let y = x * dims.width() as usize;
        let z = y * dims.height() as usize;
        Self { x, y, z }
    }
}

/// Simplified Yee-style FDTD solver running on the CPU.
///
/// Electric and magnetic fields are updated alternately from each other's
/// curl, with the field outside the grid held at zero.
#[derive(Debug, Default)]
pub struct CpuFdtd {
    dims: Option<GridDims>,
    electric: FieldBuffer,
    magnetic: FieldBuffer,
    source: FieldBuffer,
    time: f64,
}

impl CpuFdtd {
    pub fn new() -> Self {
        Self::default()
    }

    fn inject_and_decay_sources(&mut self) {
        for (e, s) in self.electric.0.iter_mut().zip(self.source.0.iter_mut()) {
            *e += *s;
            *s *= SOURCE_DECAY;
        }
    }

    fn update_magnetic(&mut self, dims: GridDims) {
        let strides = Strides::new(dims);
        let e = &self.electric.0;
        let h = &mut self.magnetic.0;
        for_each_cell(dims, |i, [x, y, z]| {
            let fx = |c| forward(e, i, c, x, dims.width(), strides.x);
            let fy = |c| forward(e, i, c, y, dims.height(), strides.y);
            let fz = |c| forward(e, i, c, z, dims.depth(), strides.z);
            h[i] -= COURANT * (fy(2) - fz(1));
            h[i + 1] -= COURANT * (fz(0) - fx(2));
            h[i + 2] -= COURANT * (fx(1) - fy(0));
        });
    }

    fn update_electric(&mut self, dims: GridDims) {
        let strides = Strides::new(dims);
        let h = &self.magnetic.0;
        let e = &mut self.electric.0;
        for_each_cell(dims, |i, [x, y, z]| {
            let bx = |c| backward(h, i, c, x, strides.x);
            let by = |c| backward(h, i, c, y, strides.y);
            let bz = |c| backward(h, i, c, z, strides.z);
            e[i] += COURANT * (by(2) - bz(1));
            e[i + 1] += COURANT * (bz(0) - bx(2));
            e[i + 2] += COURANT * (bx(1) - by(0));
        });
    }
}

/// Calls `f(index, [x, y, z])` for every cell, with `index` pointing at the
/// cell's first component.
fn for_each_cell(dims: GridDims, mut f: impl FnMut(usize, [u32; 3])) {
    let mut i = 0;
    for z in 0..dims.depth() {
        for y in 0..dims.height() {
            for x in 0..dims.width() {
                f(i, [x, y, z]);
                i += COMPONENTS;
            }
        }
    }
}

/// `field(coord + 1) - field(coord)` for one component along one axis.
fn forward(field: &[f32], i: usize, c: usize, coord: u32, dim: u32, stride: usize) -> f32 {
    let next = if coord + 1 < dim {
        field[i + stride + c]
    } else {
        0.0
    };
    next - field[i + c]
}

/// `field(coord) - field(coord - 1)` for one component along one axis.
fn backward(field: &[f32], i: usize, c: usize, coord: u32, stride: usize) -> f32 {
    let prev = if coord > 0 { field[i - stride + c] } else { 0.0 };
    field[i + c] - prev
}

impl FieldSolver for CpuFdtd {
    fn initialize(&mut self, dims: GridDims) -> Result<(), SolverError> {
        self.cleanup();
        self.electric = FieldBuffer::zeroed(dims)?;
        self.magnetic = FieldBuffer::zeroed(dims)?;
        self.source = FieldBuffer::zeroed(dims)?;
        self.dims = Some(dims);
        self.time = 0.0;
        Ok(())
    }

    fn step(&mut self) {
        let Some(dims) = self.dims else {
            return;
        };
        self.inject_and_decay_sources();
        self.update_magnetic(dims);
        self.update_electric(dims);
        self.time += TIME_STEP;
    }

    fn add_source(&mut self, at: GridPoint, value: f32) {
        let Some(dims) = self.dims else {
            return;
        };
        let strides = Strides::new(dims);
        let r = SOURCE_RADIUS;
        for dz in -r..=r {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx * dx + dy * dy + dz * dz > r * r {
                        continue;
                    }
                    let p = GridPoint {
                        x: at.x.saturating_add(dx),
                        y: at.y.saturating_add(dy),
                        z: at.z.saturating_add(dz),
                    };
                    if !dims.contains(p) {
                        continue;
                    }
                    let i = p.x as usize * strides.x
                        + p.y as usize * strides.y
                        + p.z as usize * strides.z;
                    // Sources drive the z component.
                    self.source.0[i + 2] += value;
                }
            }
        }
    }

    fn electric_field(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend_from_slice(&self.electric.0);
    }

    fn magnetic_field(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend_from_slice(&self.magnetic.0);
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn cleanup(&mut self) {
        self.dims = None;
        self.electric = FieldBuffer::default();
        self.magnetic = FieldBuffer::default();
        self.source = FieldBuffer::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn initialized(edge: u32) -> (CpuFdtd, GridDims) {
        let dims = GridDims::cube(edge).unwrap();
        let mut solver = CpuFdtd::new();
        solver.initialize(dims).unwrap();
        (solver, dims)
    }

    fn energy(field: &[f32]) -> f32 {
        field.iter().map(|v| v * v).sum()
    }

    #[test]
    fn test_initialize_zeroes_fields() {
        let (solver, dims) = initialized(4);
        let mut electric = Vec::new();
        solver.electric_field(&mut electric);
        assert_eq!(electric.len(), dims.components());
        assert!(electric.iter().all(|v| *v == 0.0));
        assert_eq!(solver.time(), 0.0);
    }

    #[test]
    fn test_step_without_sources_stays_quiet() {
        let (mut solver, _) = initialized(4);
        solver.step();
        let mut electric = Vec::new();
        solver.electric_field(&mut electric);
        assert_eq!(energy(&electric), 0.0);
        assert_approx_eq!(solver.time(), TIME_STEP);
    }

    #[test]
    fn test_source_excites_both_fields() {
        let (mut solver, dims) = initialized(8);
        solver.add_source(dims.grid_point(0.5, 0.5, 0.5), 1.0);
        solver.step();
        solver.step();

        let mut electric = Vec::new();
        let mut magnetic = Vec::new();
        solver.electric_field(&mut electric);
        solver.magnetic_field(&mut magnetic);
        assert!(energy(&electric) > 0.0);
        assert!(energy(&magnetic) > 0.0);
    }

    #[test]
    fn test_source_outside_grid_is_clipped() {
        let (mut solver, _) = initialized(4);
        solver.add_source(GridPoint { x: 100, y: 100, z: 100 }, 5.0);
        solver.step();
        let mut electric = Vec::new();
        solver.electric_field(&mut electric);
        assert_eq!(energy(&electric), 0.0);
    }

    #[test]
    fn test_source_near_edge_is_partially_painted() {
        let (mut solver, _) = initialized(4);
        solver.add_source(GridPoint { x: -1, y: 0, z: 0 }, 1.0);
        assert!(solver.source.0.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn test_sources_decay() {
        let (mut solver, dims) = initialized(6);
        solver.add_source(dims.grid_point(0.5, 0.5, 0.5), 1.0);
        let before: f32 = solver.source.0.iter().sum();
        solver.step();
        let after: f32 = solver.source.0.iter().sum();
        assert_approx_eq!(after, before * SOURCE_DECAY, 1e-4);
    }

    #[test]
    fn test_cleanup_releases_storage() {
        let (mut solver, _) = initialized(4);
        solver.cleanup();
        solver.cleanup();
        let mut electric = vec![1.0];
        solver.electric_field(&mut electric);
        assert!(electric.is_empty());
        // Steps and sources on a cleaned-up solver are ignored
        solver.step();
        solver.add_source(GridPoint { x: 0, y: 0, z: 0 }, 1.0);
    }

    #[test]
    fn test_reinitialize_resets_time() {
        let (mut solver, dims) = initialized(4);
        solver.step();
        solver.initialize(dims).unwrap();
        assert_eq!(solver.time(), 0.0);
    }
}
