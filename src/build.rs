// src/build.rs

//! Programmatic C++ compile/link flow used by `dagflow build`.
//!
//! One compile task per `.cpp` file found under the source directory, each
//! writing `<obj_dir>/<stem>.o`, plus one link task requiring all of them.
//! Tasks carry file output markers, so a rebuild skips objects that already
//! exist.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::exec::CommandTask;
use crate::flow::Flow;
use crate::fs::{FileSystem, find_files_by_ext};
use crate::task::{FileMarker, Params, Task, TaskBehavior, TaskId, TaskTemplate};

#[derive(Debug, Clone)]
pub struct CppBuild {
    pub source_dir: PathBuf,
    pub obj_dir: PathBuf,
    pub output: PathBuf,
    pub compiler: String,
    pub options: String,
    pub includes: Vec<PathBuf>,
}

impl CppBuild {
    /// Defaults for `dir`: objects under `dir/object_files`, binary `dir/app`,
    /// headers from `dir/includes`. Commands run in the current directory.
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        let source_dir = source_dir.into();
        Self {
            obj_dir: source_dir.join("object_files"),
            output: source_dir.join("app"),
            compiler: "g++".to_string(),
            options: "-Wall".to_string(),
            includes: vec![source_dir.join("includes")],
            source_dir,
        }
    }

    pub fn object_for(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.obj_dir.join(format!("{stem}.o"))
    }

    /// Build the (not yet activated) flow for the sources `fs` sees.
    pub fn flow(&self, fs: Arc<dyn FileSystem>) -> Result<Flow> {
        let sources = find_files_by_ext(&*fs, &self.source_dir, "cpp")
            .with_context(|| format!("scanning {:?} for C++ sources", self.source_dir))?;
        if sources.is_empty() {
            bail!("no .cpp files found under {:?}", self.source_dir);
        }

        let compile = {
            let this = self.clone();
            TaskTemplate::new("compile_obj", move |params: &Params| {
                let behavior: Arc<dyn TaskBehavior> =
                    Arc::new(CommandTask::new(this.compile_command(params)));
                behavior
            })
        };

        let mut flow = Flow::create("build", None);
        let mut objects = Vec::new();
        let mut compiled: Vec<TaskId> = Vec::new();
        for source in &sources {
            let object = self.object_for(source);
            let params = Params::new()
                .with("source", source.to_string_lossy())
                .with("object", object.to_string_lossy());
            let task = compile
                .instantiate(params)
                .output(FileMarker::with_fs(&object, Arc::clone(&fs)))
                .build();
            compiled.push(flow.add_task(task)?);
            objects.push(object);
        }

        let link_name = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string());
        let link = Task::builder(
            format!("link_obj_{link_name}"),
            Arc::new(CommandTask::new(self.link_command(&objects))),
        )
        .requires(compiled)
        .output(FileMarker::with_fs(&self.output, Arc::clone(&fs)))
        .build();
        flow.add_task(link)?;

        Ok(flow)
    }

    fn compile_command(&self, params: &Params) -> String {
        let mut parts = vec![
            self.compiler.clone(),
            self.options.clone(),
            "-c".to_string(),
            params.get("source").unwrap_or_default().to_string(),
            "-o".to_string(),
            params.get("object").unwrap_or_default().to_string(),
        ];
        parts.extend(self.includes.iter().map(|inc| format!("-I{}", inc.display())));
        parts.join(" ")
    }

    fn link_command(&self, objects: &[PathBuf]) -> String {
        let mut parts = vec![
            self.compiler.clone(),
            self.options.clone(),
            "-o".to_string(),
            self.output.display().to_string(),
        ];
        parts.extend(objects.iter().map(|o| o.display().to_string()));
        parts.join(" ")
    }
}
