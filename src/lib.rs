//! # testgen
//!
//! Generates NUnit test classes for a C# code base with a local language
//! model, caching every generated class by source content and model.
//!
//! ## Architecture
//!
//! - **scan**: C# source discovery and logical cache keys
//! - **extractor**: Structural extractor integration (Roslyn tool, JSON class records)
//! - **registry**: Process-wide type-name to definition map
//! - **references**: Candidate type-name collection for one class
//! - **closure**: Registry lookup with first-match fallback search over sources
//! - **cache**: Persistent generation cache using LMDB (heed)
//! - **generator**: Prompt assembly, model invocation and output validation
//! - **parse**: Hashing and generated-output checks
//! - **writer**: Test file placement inside the test project
//! - **orchestrator**: Bounded parallel per-file pipeline with fault isolation
//! - **repo**: Git retrieval of the target repository
//! - **dotnet**: Test project scaffolding, solution wiring, build and coverage

pub mod cache;
pub mod cli;
pub mod closure;
pub mod config;
pub mod dotnet;
pub mod extractor;
pub mod generator;
pub mod orchestrator;
pub mod parse;
pub mod references;
pub mod registry;
pub mod repo;
pub mod scan;
pub mod writer;
