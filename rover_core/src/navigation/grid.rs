//! Occupancy grid for global planning
//!
//! A square region of `2 * planning_range` meters centred on the world
//! origin. Occupancy is binary and is rebuilt from scratch on every planning
//! cycle: static map first, then the tracked dynamic obstacles.
//!
//! # Example
//!
//! ```rust
//! use rover_core::navigation::Grid;
//! use rover_core::messages::Point;
//!
//! let mut grid = Grid::new(10.0, 0.1);
//! grid.set_obstacle(Point::new(1.0, 1.0), 0.3);
//!
//! let (gx, gy) = grid.world_to_grid(Point::new(1.0, 1.0));
//! assert!(!grid.is_free(gx, gy));
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{RoverError, RoverResult};
use crate::messages::Point;

/// Occupancy values at or above this are obstacles
pub const STATIC_OCCUPIED_THRESHOLD: u8 = 50;

/// Pre-built occupancy map in its own frame
///
/// `data` is row-major, `width * height` cells with values 0 (free) to 100
/// (occupied). Cell `(mx, my)` has its lower-left corner at
/// `origin + (mx, my) * resolution`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticMap {
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub data: Vec<u8>,
}

impl StaticMap {
    pub fn new(
        width: usize,
        height: usize,
        resolution: f64,
        origin: (f64, f64),
        data: Vec<u8>,
    ) -> RoverResult<Self> {
        if data.len() != width * height {
            return Err(RoverError::InvalidConfig(format!(
                "static map has {} cells, expected {}x{}",
                data.len(),
                width,
                height
            )));
        }
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(RoverError::InvalidConfig(format!(
                "static map resolution must be positive, got {resolution}"
            )));
        }
        Ok(Self {
            width,
            height,
            resolution,
            origin_x: origin.0,
            origin_y: origin.1,
            data,
        })
    }

    /// World position of every occupied cell
    pub fn occupied_points(&self) -> impl Iterator<Item = Point> + '_ {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, &value)| value >= STATIC_OCCUPIED_THRESHOLD)
            .map(move |(idx, _)| {
                let mx = idx % self.width;
                let my = idx / self.width;
                Point::new(
                    mx as f64 * self.resolution + self.origin_x,
                    my as f64 * self.resolution + self.origin_y,
                )
            })
    }
}

/// Binary occupancy grid
#[derive(Debug, Clone)]
pub struct Grid {
    width: usize,
    height: usize,
    resolution: f64,
    origin: Point,
    cells: Vec<bool>,
}

impl Grid {
    /// Grid covering `[-range, range]²` at `resolution` meters per cell
    pub fn new(planning_range: f64, resolution: f64) -> Self {
        let side = ((2.0 * planning_range) / resolution).round().max(1.0) as usize;
        Self {
            width: side,
            height: side,
            resolution,
            origin: Point::new(-planning_range, -planning_range),
            cells: vec![false; side * side],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn world_to_grid(&self, point: Point) -> (i32, i32) {
        (
            ((point.x - self.origin.x) / self.resolution).floor() as i32,
            ((point.y - self.origin.y) / self.resolution).floor() as i32,
        )
    }

    /// Centre of the cell in world coordinates
    pub fn grid_to_world(&self, gx: i32, gy: i32) -> Point {
        Point::new(
            (gx as f64 + 0.5) * self.resolution + self.origin.x,
            (gy as f64 + 0.5) * self.resolution + self.origin.y,
        )
    }

    pub fn is_valid(&self, gx: i32, gy: i32) -> bool {
        gx >= 0 && gy >= 0 && (gx as usize) < self.width && (gy as usize) < self.height
    }

    /// Out-of-bounds cells are never free
    pub fn is_free(&self, gx: i32, gy: i32) -> bool {
        self.is_valid(gx, gy) && !self.cells[self.index(gx, gy)]
    }

    pub fn set_occupied(&mut self, gx: i32, gy: i32) {
        if self.is_valid(gx, gy) {
            let idx = self.index(gx, gy);
            self.cells[idx] = true;
        }
    }

    /// Mark every cell whose centre lies within `radius` of `center`
    pub fn set_obstacle(&mut self, center: Point, radius: f64) {
        let (cx, cy) = self.world_to_grid(center);
        let reach = (radius / self.resolution) as i32 + 1;

        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let (gx, gy) = (cx + dx, cy + dy);
                if !self.is_valid(gx, gy) {
                    continue;
                }
                if self.grid_to_world(gx, gy).distance_to(&center) <= radius {
                    self.set_occupied(gx, gy);
                }
            }
        }
    }

    /// Stamp the occupied cells of a pre-built map
    pub fn stamp_static_map(&mut self, map: &StaticMap) {
        for point in map.occupied_points() {
            let (gx, gy) = self.world_to_grid(point);
            self.set_occupied(gx, gy);
        }
    }

    pub fn clear(&mut self) {
        self.cells.fill(false);
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|&&occupied| occupied).count()
    }

    fn index(&self, gx: i32, gy: i32) -> usize {
        gy as usize * self.width + gx as usize
    }
}
