#![deny(unused_imports)]

pub mod aggregate;
pub mod basis;
pub mod config;
pub mod construction;
pub mod data;
pub mod estimate;
pub mod faer_ndarray;
pub mod gate;
pub mod marginal;
pub mod model;
pub mod pipeline;
pub mod pirls;
pub mod qualify;
pub mod seeding;
pub mod terms;
