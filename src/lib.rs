// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MDL schema analyzer and serializer generator.
//!
//! The compiler core consumes an already parsed schema ([`ast::File`])
//! together with a target configuration ([`options::Options`]) and a
//! primitive catalog ([`library::CodeLibrary`]), and emits C++ source
//! units implementing the wire format of every message in the schema.

pub mod analyzer;
pub mod ast;
pub mod backends;
pub mod corelib;
pub mod eval;
pub mod generator;
pub mod library;
pub mod options;
