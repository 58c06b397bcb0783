//! Dynamic window local planner
//!
//! Samples the admissible `(v, ω)` space, rolls each pair forward over a
//! short horizon and keeps the best scoring collision-free candidate.

use serde::{Deserialize, Serialize};

use crate::config::DwaConfig;
use crate::messages::{Point, Pose2D};

/// Disc obstacle in world coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedObstacle {
    pub center: Point,
    pub radius: f64,
    /// Observation time, seconds since the UNIX epoch
    pub timestamp: f64,
    pub confidence: f64,
}

impl TrackedObstacle {
    pub fn contains(&self, point: &Point) -> bool {
        self.center.distance_to(point) <= self.radius
    }

    /// Distance from `point` to the obstacle boundary (negative inside)
    pub fn clearance(&self, point: &Point) -> f64 {
        self.center.distance_to(point) - self.radius
    }

    pub fn is_expired(&self, now: f64, max_age: f64) -> bool {
        now - self.timestamp > max_age
    }
}

/// Velocity pair chosen by the local planner (m/s, rad/s)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityCommand {
    pub linear: f64,
    pub angular: f64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct DynamicWindow {
    config: DwaConfig,
    max_linear: f64,
    max_angular: f64,
}

impl DynamicWindow {
    pub fn new(config: DwaConfig, max_linear: f64, max_angular: f64) -> Self {
        Self {
            config,
            max_linear,
            max_angular,
        }
    }

    /// Best collision-free velocity toward `goal`, or `None` when every
    /// sampled trajectory hits an obstacle
    pub fn compute_velocity(
        &self,
        pose: &Pose2D,
        goal: Point,
        obstacles: &[TrackedObstacle],
    ) -> Option<VelocityCommand> {
        let v_steps = (self.max_linear / self.config.v_resolution).round() as i64;
        let w_steps = (self.max_angular / self.config.w_resolution).round() as i64;

        let mut best: Option<VelocityCommand> = None;
        for vi in 0..=v_steps {
            let v = (vi as f64 * self.config.v_resolution).min(self.max_linear);
            for wi in -w_steps..=w_steps {
                let w = (wi as f64 * self.config.w_resolution).clamp(-self.max_angular, self.max_angular);

                let trajectory = self.rollout(pose, v, w);
                if collides(&trajectory, obstacles) {
                    continue;
                }

                let score = self.score(&trajectory, goal, obstacles, v);
                if best.map_or(true, |b| score > b.score) {
                    best = Some(VelocityCommand {
                        linear: v,
                        angular: w,
                        score,
                    });
                }
            }
        }
        best
    }

    /// Forward-simulate unicycle motion; returns the visited points
    pub fn rollout(&self, pose: &Pose2D, v: f64, w: f64) -> Vec<Point> {
        let dt = self.config.dt;
        let (mut x, mut y, mut theta) = (pose.x, pose.y, pose.theta);
        let mut points = Vec::with_capacity(self.config.steps);
        for _ in 0..self.config.steps {
            x += v * theta.cos() * dt;
            y += v * theta.sin() * dt;
            theta += w * dt;
            points.push(Point::new(x, y));
        }
        points
    }

    fn score(&self, trajectory: &[Point], goal: Point, obstacles: &[TrackedObstacle], v: f64) -> f64 {
        let Some(end) = trajectory.last() else {
            return f64::NEG_INFINITY;
        };
        let goal_term = -end.distance_to(&goal) * self.config.goal_weight;

        // No obstacles contributes no clearance term
        let clearance = trajectory
            .iter()
            .flat_map(|p| obstacles.iter().map(move |o| o.clearance(p)))
            .fold(f64::INFINITY, f64::min);
        let obstacle_term = if clearance.is_finite() {
            clearance * self.config.obstacle_weight
        } else {
            0.0
        };

        goal_term + obstacle_term + v * self.config.velocity_weight
    }
}

fn collides(trajectory: &[Point], obstacles: &[TrackedObstacle]) -> bool {
    trajectory
        .iter()
        .any(|p| obstacles.iter().any(|o| o.contains(p)))
}
