//! A* global planner on the occupancy [`Grid`]
//!
//! 8-connected search with unit cost for axis moves and √2 for diagonals,
//! guided by the (optionally weighted) Euclidean distance to the goal.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::debug;

use super::grid::Grid;
use crate::messages::Point;

type Cell = (i32, i32);

const NEIGHBORS: [(i32, i32); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    cell: Cell,
    f_score: f64,
}

impl PartialEq for OpenNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenNode {}

impl Ord for OpenNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on f
        other.f_score.total_cmp(&self.f_score)
    }
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct AStarPlanner {
    heuristic_weight: f64,
    max_iterations: usize,
}

impl AStarPlanner {
    pub fn new(heuristic_weight: f64, max_iterations: usize) -> Self {
        Self {
            heuristic_weight,
            max_iterations,
        }
    }

    /// World-coordinate path of cell centres from `start` to `goal`
    ///
    /// Empty when either endpoint is blocked or the expansion budget runs
    /// out before the goal is reached.
    pub fn plan_path(&self, grid: &Grid, start: Point, goal: Point) -> Vec<Point> {
        let start_cell = grid.world_to_grid(start);
        let goal_cell = grid.world_to_grid(goal);

        if !grid.is_free(start_cell.0, start_cell.1) || !grid.is_free(goal_cell.0, goal_cell.1) {
            debug!(?start_cell, ?goal_cell, "start or goal cell is blocked");
            return Vec::new();
        }

        match self.search(grid, start_cell, goal_cell) {
            Some(cells) => cells
                .into_iter()
                .map(|(gx, gy)| grid.grid_to_world(gx, gy))
                .collect(),
            None => Vec::new(),
        }
    }

    fn search(&self, grid: &Grid, start: Cell, goal: Cell) -> Option<Vec<Cell>> {
        let mut open = BinaryHeap::new();
        let mut closed: HashSet<Cell> = HashSet::new();
        let mut came_from: HashMap<Cell, Cell> = HashMap::new();
        let mut g_score: HashMap<Cell, f64> = HashMap::new();

        g_score.insert(start, 0.0);
        open.push(OpenNode {
            cell: start,
            f_score: self.heuristic(start, goal),
        });

        let mut iterations = 0;
        while let Some(current) = open.pop() {
            if iterations >= self.max_iterations {
                debug!(iterations, "A* expansion budget exhausted");
                return None;
            }
            iterations += 1;

            if current.cell == goal {
                debug!(iterations, "A* reached goal");
                return Some(reconstruct(&came_from, goal));
            }
            if !closed.insert(current.cell) {
                continue;
            }

            let current_g = g_score.get(&current.cell).copied().unwrap_or(f64::INFINITY);
            for (dx, dy) in NEIGHBORS {
                let neighbor = (current.cell.0 + dx, current.cell.1 + dy);
                if !grid.is_free(neighbor.0, neighbor.1) || closed.contains(&neighbor) {
                    continue;
                }

                let step = if dx != 0 && dy != 0 {
                    std::f64::consts::SQRT_2
                } else {
                    1.0
                };
                let tentative = current_g + step;
                if tentative < g_score.get(&neighbor).copied().unwrap_or(f64::INFINITY) {
                    came_from.insert(neighbor, current.cell);
                    g_score.insert(neighbor, tentative);
                    open.push(OpenNode {
                        cell: neighbor,
                        f_score: tentative + self.heuristic(neighbor, goal),
                    });
                }
            }
        }

        debug!(iterations, "A* open set exhausted");
        None
    }

    fn heuristic(&self, a: Cell, b: Cell) -> f64 {
        let dx = (a.0 - b.0) as f64;
        let dy = (a.1 - b.1) as f64;
        dx.hypot(dy) * self.heuristic_weight
    }
}

fn reconstruct(came_from: &HashMap<Cell, Cell>, goal: Cell) -> Vec<Cell> {
    let mut path = vec![goal];
    let mut current = goal;
    while let Some(&parent) = came_from.get(&current) {
        path.push(parent);
        current = parent;
    }
    path.reverse();
    path
}

/// Sum of segment lengths
pub fn path_length(path: &[Point]) -> f64 {
    path.windows(2).map(|w| w[0].distance_to(&w[1])).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> AStarPlanner {
        AStarPlanner::new(1.0, 1000)
    }

    #[test]
    fn test_diagonal_on_empty_grid() {
        let grid = Grid::new(10.0, 0.1);
        let start = Point::new(0.0, 0.0);
        let goal = Point::new(5.0, 5.0);

        let path = planner().plan_path(&grid, start, goal);

        assert!(!path.is_empty());
        let straight = start.distance_to(&goal);
        let length = path_length(&path);
        let diagonal_step = 0.1 * std::f64::consts::SQRT_2;
        assert!(
            (length - straight).abs() <= diagonal_step + 1e-9,
            "length {length} vs straight {straight}"
        );
        assert!(path[0].distance_to(&start) < 0.1);
        assert!(path[path.len() - 1].distance_to(&goal) < 0.1);
    }

    #[test]
    fn test_same_cell_is_single_point() {
        let grid = Grid::new(2.0, 0.1);
        let path = planner().plan_path(&grid, Point::new(0.01, 0.01), Point::new(0.02, 0.02));
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn test_detour_through_gap() {
        let mut grid = Grid::new(2.0, 0.1);
        // Vertical wall at x = 0.5 m with a gap near y = 1.5 m
        let wall_x = grid.world_to_grid(Point::new(0.55, 0.0)).0;
        for gy in 0..35 {
            grid.set_occupied(wall_x, gy);
        }

        let path = AStarPlanner::new(1.0, 20_000).plan_path(
            &grid,
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
        );

        assert!(!path.is_empty());
        for point in &path {
            let (gx, gy) = grid.world_to_grid(*point);
            assert!(grid.is_free(gx, gy), "path crosses occupied cell ({gx}, {gy})");
        }
        assert!(path.iter().any(|p| p.y > 1.4));
    }

    #[test]
    fn test_full_wall_gives_empty_path() {
        let mut grid = Grid::new(2.0, 0.1);
        let wall_x = grid.world_to_grid(Point::new(0.55, 0.0)).0;
        for gy in 0..grid.height() as i32 {
            grid.set_occupied(wall_x, gy);
        }

        let path = AStarPlanner::new(1.0, 20_000).plan_path(
            &grid,
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
        );
        assert!(path.is_empty());
    }

    #[test]
    fn test_blocked_goal_or_start() {
        let mut grid = Grid::new(2.0, 0.1);
        grid.set_obstacle(Point::new(1.0, 1.0), 0.2);

        assert!(planner()
            .plan_path(&grid, Point::new(0.0, 0.0), Point::new(1.0, 1.0))
            .is_empty());
        assert!(planner()
            .plan_path(&grid, Point::new(1.0, 1.0), Point::new(0.0, 0.0))
            .is_empty());
        // Outside the planning region
        assert!(planner()
            .plan_path(&grid, Point::new(0.0, 0.0), Point::new(5.0, 0.0))
            .is_empty());
    }

    #[test]
    fn test_budget_exhaustion() {
        let grid = Grid::new(10.0, 0.1);
        let path = AStarPlanner::new(1.0, 10).plan_path(
            &grid,
            Point::new(0.0, 0.0),
            Point::new(5.0, 5.0),
        );
        assert!(path.is_empty());
    }

    #[test]
    fn test_path_is_connected() {
        let mut grid = Grid::new(3.0, 0.1);
        grid.set_obstacle(Point::new(1.0, 0.0), 0.4);

        let path = AStarPlanner::new(1.0, 20_000).plan_path(
            &grid,
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
        );

        assert!(!path.is_empty());
        for pair in path.windows(2) {
            assert!(pair[0].distance_to(&pair[1]) <= 0.1 * std::f64::consts::SQRT_2 + 1e-9);
        }
    }
}
