//! Field Solver interface and the compute backends behind it.
//!
//! The session layer only talks to [`FieldSolver`]; the numerical kernels and
//! the buffers they run on belong to the backend. A backend is picked once,
//! when a session is created, through a [`SolverFactory`].

mod cpu;
mod headless;

pub use cpu::CpuFdtd;
pub use headless::Headless;

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Field components stored per grid cell (x, y, z).
pub const COMPONENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolverError {
    #[error("invalid grid dimensions {width}x{height}x{depth}")]
    InvalidDimensions { width: u32, height: u32, depth: u32 },

    #[error("failed to allocate {bytes} bytes of field storage")]
    Allocation { bytes: usize },

    #[error("compute backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Grid size of one simulation; every dimension is at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDims {
    width: u32,
    height: u32,
    depth: u32,
}

/// Edge length of the default cubic grid.
pub const DEFAULT_GRID_EDGE: u32 = 128;

impl Default for GridDims {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_EDGE,
            height: DEFAULT_GRID_EDGE,
            depth: DEFAULT_GRID_EDGE,
        }
    }
}

impl GridDims {
    pub fn new(width: u32, height: u32, depth: u32) -> Result<Self, SolverError> {
        let dims = Self {
            width,
            height,
            depth,
        };
        if width == 0 || height == 0 || depth == 0 || dims.field_len().is_none() {
            return Err(SolverError::InvalidDimensions {
                width,
                height,
                depth,
            });
        }
        Ok(dims)
    }

    /// A cube with the given edge length.
    pub fn cube(edge: u32) -> Result<Self, SolverError> {
        Self::new(edge, edge, edge)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// Length of one flattened vector field (`cells * 3`), or `None` if it
    /// would not fit in memory addressing or in a wire payload.
    fn field_len(&self) -> Option<usize> {
        let len = (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.depth as usize)?
            .checked_mul(COMPONENTS)?;
        // Two fields of f32 must fit behind a u32 payload length.
        let frame_bytes = len.checked_mul(2 * std::mem::size_of::<f32>())?;
        u32::try_from(frame_bytes).ok()?;
        Some(len)
    }

    /// Number of `f32` values in one vector field snapshot.
    pub fn components(&self) -> usize {
        self.cells() * COMPONENTS
    }

    /// Size in bytes of a full frame: electric plus magnetic field.
    pub fn frame_bytes(&self) -> usize {
        self.components() * std::mem::size_of::<f32>() * 2
    }

    /// Maps a normalized coordinate triple to a grid cell with
    /// `floor(coord * dimension)`. Out-of-range coordinates give out-of-grid
    /// points; clipping is the solver's business.
    pub fn grid_point(&self, x: f32, y: f32, z: f32) -> GridPoint {
        GridPoint {
            x: scale(x, self.width),
            y: scale(y, self.height),
            z: scale(z, self.depth),
        }
    }

    /// Whether `point` lies inside the grid.
    pub fn contains(&self, point: GridPoint) -> bool {
        (0..self.width as i64).contains(&point.x)
            && (0..self.height as i64).contains(&point.y)
            && (0..self.depth as i64).contains(&point.z)
    }
}

fn scale(coord: f32, dimension: u32) -> i64 {
    // `as` saturates, and NaN maps to 0
    (f64::from(coord) * f64::from(dimension)).floor() as i64
}

impl fmt::Display for GridDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

impl FromStr for GridDims {
    type Err = String;

    /// Parses `WxHxD`, or a single number for a cube.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(['x', 'X']).collect();
        let numbers = parts
            .iter()
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid grid size {s:?}: {e}"))?;
        let dims = match numbers.as_slice() {
            [edge] => GridDims::cube(*edge),
            [w, h, d] => GridDims::new(*w, *h, *d),
            _ => return Err(format!("invalid grid size {s:?}: expected WxHxD")),
        };
        dims.map_err(|e| e.to_string())
    }
}

/// A cell index; may lie outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridPoint {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// One simulation's numerical engine.
///
/// Implementations own all of their field storage. Callers only ever see
/// copies handed out through `electric_field` and `magnetic_field`.
pub trait FieldSolver: Send {
    /// Allocates storage for `dims` and resets time to zero. Calling it again
    /// re-initializes from scratch.
    fn initialize(&mut self, dims: GridDims) -> Result<(), SolverError>;

    /// Advances the simulation by one time step.
    fn step(&mut self);

    /// Injects a localized source of strength `value` around `at`.
    fn add_source(&mut self, at: GridPoint, value: f32);

    /// Copies the electric field into `out`, resizing it to `dims.components()`.
    fn electric_field(&self, out: &mut Vec<f32>);

    /// Copies the magnetic field into `out`, resizing it to `dims.components()`.
    fn magnetic_field(&self, out: &mut Vec<f32>);

    /// Simulation time in seconds.
    fn time(&self) -> f64;

    /// Releases field storage. Safe to call more than once.
    fn cleanup(&mut self);
}

/// Builds uninitialized solvers for new sessions.
pub trait SolverFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self) -> Box<dyn FieldSolver>;
}

/// Built-in compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Finite-difference time-domain update on the CPU
    #[default]
    Cpu,
    /// Advances time only; zero-filled fields
    Headless,
}

impl SolverFactory for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Headless => "headless",
        }
    }

    fn create(&self) -> Box<dyn FieldSolver> {
        match self {
            Backend::Cpu => Box::new(CpuFdtd::new()),
            Backend::Headless => Box::new(Headless::new()),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "headless" => Ok(Backend::Headless),
            other => Err(format!("unknown backend {other:?} (expected cpu or headless)")),
        }
    }
}

/// Allocates a zeroed `f32` buffer, reporting failure instead of aborting.
pub(crate) fn try_zeroed(len: usize) -> Result<Vec<f32>, SolverError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| SolverError::Allocation {
            bytes: len.saturating_mul(std::mem::size_of::<f32>()),
        })?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dims_rejects_zero() {
        assert_eq!(
            GridDims::new(0, 4, 4),
            Err(SolverError::InvalidDimensions {
                width: 0,
                height: 4,
                depth: 4
            })
        );
        assert!(GridDims::new(4, 4, 0).is_err());
    }

    #[test]
    fn test_grid_dims_rejects_oversized_frame() {
        assert!(GridDims::cube(4096).is_err());
    }

    #[test]
    fn test_frame_bytes_for_default_grid() {
        let dims = GridDims::default();
        assert_eq!(dims, GridDims::cube(128).unwrap());
        assert_eq!(dims.components(), 128 * 128 * 128 * 3);
        assert_eq!(dims.frame_bytes(), 128 * 128 * 128 * 3 * 4 * 2);
    }

    #[test]
    fn test_grid_point_floors() {
        let dims = GridDims::new(10, 20, 30).unwrap();
        assert_eq!(
            dims.grid_point(0.5, 0.55, 0.99),
            GridPoint { x: 5, y: 11, z: 29 }
        );
        assert_eq!(dims.grid_point(1.0, 0.0, 0.0).x, 10);
        assert_eq!(dims.grid_point(-0.01, 0.0, 0.0).x, -1);
    }

    #[test]
    fn test_contains() {
        let dims = GridDims::cube(4).unwrap();
        assert!(dims.contains(GridPoint { x: 0, y: 3, z: 2 }));
        assert!(!dims.contains(GridPoint { x: 4, y: 0, z: 0 }));
        assert!(!dims.contains(GridPoint { x: 0, y: -1, z: 0 }));
    }

    #[test]
    fn test_parse_grid_dims() {
        assert_eq!("8x16x32".parse::<GridDims>(), GridDims::new(8, 16, 32).map_err(|e| e.to_string()));
        assert_eq!("64".parse::<GridDims>().unwrap(), GridDims::cube(64).unwrap());
        assert!("8x16".parse::<GridDims>().is_err());
        assert!("0x1x1".parse::<GridDims>().is_err());
        assert!("axbxc".parse::<GridDims>().is_err());
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!("CPU".parse::<Backend>(), Ok(Backend::Cpu));
        assert_eq!("headless".parse::<Backend>(), Ok(Backend::Headless));
        assert!("vulkan".parse::<Backend>().is_err());
    }

    #[test]
    fn test_backends_are_interchangeable() {
        let dims = GridDims::cube(4).unwrap();
        for backend in [Backend::Cpu, Backend::Headless] {
            let mut solver = backend.create();
            solver.initialize(dims).unwrap();
            solver.add_source(dims.grid_point(0.5, 0.5, 0.5), 1.0);
            solver.step();

            let mut electric = Vec::new();
            let mut magnetic = Vec::new();
            solver.electric_field(&mut electric);
            solver.magnetic_field(&mut magnetic);

            assert_eq!(electric.len(), dims.components(), "{}", backend.name());
            assert_eq!(magnetic.len(), dims.components(), "{}", backend.name());
            assert!(solver.time() > 0.0);
            solver.cleanup();
        }
    }
}
