//! Goal-directed navigation
//!
//! [`PathPlanner`] owns the occupancy grid, the A* and dynamic-window
//! planners and the set of tracked obstacles. Each control tick it turns
//! the current pose and range readings into one [`NavigationCommand`].

use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_4;
use std::fmt;
use tracing::{debug, info, warn};

use super::astar::AStarPlanner;
use super::dwa::{DynamicWindow, TrackedObstacle};
use super::grid::{Grid, StaticMap};
use crate::config::PlannerConfig;
use crate::messages::{normalize_angle, CommandKind, NavigationCommand, ObstacleObservation, Point, Pose2D};
use crate::sensors::SensorSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerState {
    Idle,
    Planning,
    FollowingPath,
    AvoidingObstacle,
    ReachedGoal,
    Failed,
}

impl PlannerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::FollowingPath => "following_path",
            Self::AvoidingObstacle => "avoiding_obstacle",
            Self::ReachedGoal => "reached_goal",
            Self::Failed => "failed",
        }
    }

    /// Actively driving along a path
    pub fn is_navigating(self) -> bool {
        matches!(self, Self::FollowingPath | Self::AvoidingObstacle)
    }
}

impl fmt::Display for PlannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannerStatus {
    pub state: PlannerState,
    pub pose: Pose2D,
    pub goal: Option<Point>,
    pub path_points: usize,
    pub path_index: usize,
    /// Percent of path points passed
    pub path_progress: f64,
    pub obstacles: usize,
    pub grid_width: usize,
    pub grid_height: usize,
    pub grid_resolution: f64,
}

pub struct PathPlanner {
    config: PlannerConfig,
    grid: Grid,
    astar: AStarPlanner,
    dwa: DynamicWindow,
    static_map: Option<StaticMap>,

    state: PlannerState,
    pose: Pose2D,
    goal: Option<Point>,
    path: Vec<Point>,
    path_index: usize,
    obstacles: Vec<TrackedObstacle>,
}

impl PathPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        let grid = Grid::new(config.planning_range, config.grid_size);
        let astar = AStarPlanner::new(config.heuristic_weight, config.max_iterations);
        let dwa = DynamicWindow::new(
            config.dwa.clone(),
            config.max_linear_speed,
            config.max_angular_speed,
        );
        info!(
            width = grid.width(),
            height = grid.height(),
            resolution = grid.resolution(),
            "path planner initialized"
        );
        Self {
            config,
            grid,
            astar,
            dwa,
            static_map: None,
            state: PlannerState::Idle,
            pose: Pose2D::default(),
            goal: None,
            path: Vec::new(),
            path_index: 0,
            obstacles: Vec::new(),
        }
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    pub fn goal(&self) -> Option<Point> {
        self.goal
    }

    pub fn path(&self) -> &[Point] {
        &self.path
    }

    pub fn obstacles(&self) -> &[TrackedObstacle] {
        &self.obstacles
    }

    pub fn update_pose(&mut self, pose: Pose2D) {
        self.pose = pose;
    }

    /// Set a new goal and plan toward it; false if no path was found
    ///
    /// Non-finite goals are refused and leave the planner untouched.
    pub fn set_goal(&mut self, goal: Point) -> bool {
        if !goal.is_finite() {
            warn!(x = goal.x, y = goal.y, "non-finite goal ignored");
            return false;
        }
        info!(x = goal.x, y = goal.y, "navigation goal set");
        self.goal = Some(goal);
        self.state = PlannerState::Planning;
        self.plan()
    }

    /// Drop the goal and return to Idle
    pub fn clear_goal(&mut self) {
        self.goal = None;
        self.path.clear();
        self.path_index = 0;
        self.state = PlannerState::Idle;
        debug!("navigation goal cleared");
    }

    /// Replace the pre-built occupancy map; re-plans if currently driving
    pub fn set_static_map(&mut self, map: Option<StaticMap>) {
        self.static_map = map;
        if self.state.is_navigating() {
            info!("static map changed, re-planning");
            self.plan();
        }
    }

    /// Rebuild the grid and search from the current pose to the goal
    pub fn plan(&mut self) -> bool {
        let Some(goal) = self.goal else {
            return false;
        };

        self.rebuild_grid();
        let start = self.pose.position();
        let path = self.astar.plan_path(&self.grid, start, goal);

        if path.is_empty() {
            warn!(
                from_x = start.x,
                from_y = start.y,
                to_x = goal.x,
                to_y = goal.y,
                "path planning failed"
            );
            self.path.clear();
            self.path_index = 0;
            self.state = PlannerState::Failed;
            false
        } else {
            info!(points = path.len(), to_x = goal.x, to_y = goal.y, "path planned");
            self.path = path;
            self.path_index = 0;
            self.state = PlannerState::FollowingPath;
            true
        }
    }

    /// Merge fresh observations into the tracked set
    ///
    /// Observations are placed relative to the current pose. Expired
    /// obstacles are dropped first. If a new obstacle sits on the remaining
    /// path, the path is re-planned.
    pub fn update_obstacles(&mut self, observations: &[ObstacleObservation], now: f64) {
        let new: Vec<TrackedObstacle> = observations
            .iter()
            .filter(|o| o.is_usable())
            .map(|o| {
                let bearing = self.pose.theta + o.angle;
                TrackedObstacle {
                    center: Point::new(
                        self.pose.x + o.distance * bearing.cos(),
                        self.pose.y + o.distance * bearing.sin(),
                    ),
                    radius: self.config.obstacle_inflation,
                    timestamp: now,
                    confidence: o.confidence,
                }
            })
            .collect();

        self.expire_obstacles(now);
        let added = !new.is_empty();
        self.obstacles.extend(new);

        if added && self.state.is_navigating() && self.path_blocked() {
            info!(obstacles = self.obstacles.len(), "obstacle on path, re-planning");
            self.plan();
        }
    }

    /// Produce the motion command for this tick
    ///
    /// `None` means the planner has nothing to say (idle, failed, or no
    /// path to follow).
    pub fn next_command(&mut self, sensors: Option<&SensorSnapshot>, now: f64) -> Option<NavigationCommand> {
        if self.state == PlannerState::Idle {
            return None;
        }

        if let Some(goal) = self.goal {
            if self.pose.position().distance_to(&goal) < self.config.goal_tolerance {
                if self.state != PlannerState::ReachedGoal {
                    info!(x = self.pose.x, y = self.pose.y, "goal reached");
                }
                self.state = PlannerState::ReachedGoal;
                return Some(NavigationCommand::stop());
            }
        }

        if let Some(snapshot) = sensors {
            let min_distance = snapshot.min_distance();
            if min_distance < self.config.emergency_stop_distance {
                warn!(min_distance, "range below emergency threshold");
                return Some(NavigationCommand::emergency_stop());
            }
        }

        if !self.state.is_navigating() {
            return None;
        }
        let Some(target) = self.lookahead_point() else {
            return Some(NavigationCommand::stop());
        };

        self.expire_obstacles(now);
        if self.obstacles.is_empty() {
            self.state = PlannerState::FollowingPath;
            return Some(self.pure_pursuit(target));
        }

        self.state = PlannerState::AvoidingObstacle;
        match self.dwa.compute_velocity(&self.pose, target, &self.obstacles) {
            Some(velocity) => Some(NavigationCommand::from_velocity(
                velocity.linear,
                velocity.angular,
                self.config.max_linear_speed,
                self.config.max_angular_speed,
                CommandKind::AvoidObstacle,
            )),
            None => {
                warn!(obstacles = self.obstacles.len(), "no collision-free trajectory");
                Some(NavigationCommand::halt(CommandKind::Blocked))
            }
        }
    }

    pub fn status(&self) -> PlannerStatus {
        let path_progress = if self.path.is_empty() {
            0.0
        } else {
            self.path_index as f64 / self.path.len() as f64 * 100.0
        };
        PlannerStatus {
            state: self.state,
            pose: self.pose,
            goal: self.goal,
            path_points: self.path.len(),
            path_index: self.path_index,
            path_progress,
            obstacles: self.obstacles.len(),
            grid_width: self.grid.width(),
            grid_height: self.grid.height(),
            grid_resolution: self.grid.resolution(),
        }
    }

    /// First remaining path point at least the look-ahead distance away,
    /// or the final point
    fn lookahead_point(&mut self) -> Option<Point> {
        let position = self.pose.position();
        for (i, point) in self.path.iter().enumerate().skip(self.path_index) {
            if position.distance_to(point) >= self.config.lookahead_distance {
                self.path_index = i;
                return Some(*point);
            }
        }
        self.path.last().copied()
    }

    fn pure_pursuit(&self, target: Point) -> NavigationCommand {
        let position = self.pose.position();
        let heading_error = normalize_angle(position.angle_to(&target) - self.pose.theta);
        let distance = position.distance_to(&target);

        let mut linear = (distance * 0.5).min(self.config.max_linear_speed);
        if heading_error.abs() > FRAC_PI_4 {
            linear *= 0.5;
        }
        let angular = (heading_error * 2.0)
            .clamp(-self.config.max_angular_speed, self.config.max_angular_speed);

        NavigationCommand::from_velocity(
            linear,
            angular,
            self.config.max_linear_speed,
            self.config.max_angular_speed,
            CommandKind::PurePursuit,
        )
    }

    fn expire_obstacles(&mut self, now: f64) {
        let max_age = self.config.obstacle_max_age;
        let before = self.obstacles.len();
        self.obstacles.retain(|o| !o.is_expired(now, max_age));
        let dropped = before - self.obstacles.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.obstacles.len(), "obstacles expired");
        }
    }

    fn path_blocked(&self) -> bool {
        self.path
            .iter()
            .skip(self.path_index)
            .any(|p| self.obstacles.iter().any(|o| o.contains(p)))
    }

    fn rebuild_grid(&mut self) {
        self.grid.clear();
        if let Some(map) = &self.static_map {
            self.grid.stamp_static_map(map);
        }
        for obstacle in &self.obstacles {
            self.grid.set_obstacle(obstacle.center, obstacle.radius);
        }
    }
}
