//! Per-frame pass list with barrier synthesis between adjacent passes.
//!
//! A graph is built, compiled, executed and dropped every frame. Each pass
//! declares the state it expects its textures in on entry and the state it
//! leaves them in on exit. Before every pass but the first, the exit state of
//! the previous pass and the entry state of the next are merged into one
//! pipeline barrier.
//!
//! Only adjacent passes are compared. A texture written by one pass and read
//! two passes later gets no dependency unless the pass in between declares
//! it too.

use std::fmt;
use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use tessera_gpu::{
    CommandRecorder, GpuDevice, GpuError, ImageBarrier, PipelineBarrier, Result, Texture,
};

/// Required state of one texture at a pass boundary.
#[derive(Debug, Clone)]
pub struct PassDependency {
    /// Texture the pass touches.
    pub texture: Texture,
    /// Accesses performed at this boundary.
    pub access: vk::AccessFlags2,
    /// Layout the texture must be in.
    pub layout: vk::ImageLayout,
    /// Pipeline stages performing the access.
    pub stage: vk::PipelineStageFlags2,
}

/// Entry and exit dependencies of a pass.
#[derive(Debug, Clone, Default)]
pub struct PassDependencies {
    entry: Vec<PassDependency>,
    exit: Vec<PassDependency>,
}

impl PassDependencies {
    /// Declare the state a texture must be in when the pass starts.
    pub fn entry(
        &mut self,
        texture: &Texture,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
    ) -> &mut Self {
        self.entry.push(PassDependency {
            texture: texture.clone(),
            access,
            layout,
            stage,
        });
        self
    }

    /// Declare the state the pass leaves a texture in.
    pub fn exit(
        &mut self,
        texture: &Texture,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
    ) -> &mut Self {
        self.exit.push(PassDependency {
            texture: texture.clone(),
            access,
            layout,
            stage,
        });
        self
    }

    /// Declare the same state on entry and exit.
    pub fn access(
        &mut self,
        texture: &Texture,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
    ) -> &mut Self {
        self.entry(texture, access, layout, stage)
            .exit(texture, access, layout, stage)
    }

    /// Entry dependencies in declaration order.
    pub fn entry_deps(&self) -> &[PassDependency] {
        &self.entry
    }

    /// Exit dependencies in declaration order.
    pub fn exit_deps(&self) -> &[PassDependency] {
        &self.exit
    }
}

/// Lifecycle of a [`RenderGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Passes may be added.
    Building,
    /// Pass list is frozen.
    Compiled,
    /// Commands were submitted.
    Executed,
}

type PassFn<'a> = Box<dyn FnOnce(&mut dyn CommandRecorder) + 'a>;

struct Pass<'a> {
    name: String,
    dependencies: PassDependencies,
    execute: PassFn<'a>,
}

/// Ordered list of passes rendering into one target.
pub struct RenderGraph<'a> {
    device: Arc<dyn GpuDevice>,
    target: Texture,
    passes: Vec<Pass<'a>>,
    state: GraphState,
}

impl<'a> RenderGraph<'a> {
    /// Start an empty graph.
    pub fn new(device: Arc<dyn GpuDevice>, target: Texture) -> Self {
        Self {
            device,
            target,
            passes: Vec::new(),
            state: GraphState::Building,
        }
    }

    /// Append a pass.
    ///
    /// `declare` runs immediately and fills in the pass dependencies.
    /// `execute` records the pass commands during [`execute`](Self::execute).
    pub fn add_pass(
        &mut self,
        name: impl Into<String>,
        declare: impl FnOnce(&mut PassDependencies),
        execute: impl FnOnce(&mut dyn CommandRecorder) + 'a,
    ) -> Result<()> {
        if self.state != GraphState::Building {
            return Err(GpuError::InvalidState(format!(
                "cannot add a pass to a graph in state {:?}",
                self.state
            )));
        }

        let mut dependencies = PassDependencies::default();
        declare(&mut dependencies);
        self.passes.push(Pass {
            name: name.into(),
            dependencies,
            execute: Box::new(execute),
        });
        Ok(())
    }

    /// Freeze the pass list.
    pub fn compile(&mut self) -> Result<()> {
        if self.state != GraphState::Building {
            return Err(GpuError::InvalidState(format!(
                "cannot compile a graph in state {:?}",
                self.state
            )));
        }
        self.state = GraphState::Compiled;
        tracing::trace!(passes = self.passes.len(), "Compiled render graph");
        Ok(())
    }

    /// Record every pass in order, with barriers in between, and submit.
    ///
    /// Compiles first if still building. May only be called once.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn execute(&mut self) -> Result<()> {
        match self.state {
            GraphState::Building => self.compile()?,
            GraphState::Compiled => {}
            GraphState::Executed => {
                return Err(GpuError::InvalidState(
                    "render graph was already executed".into(),
                ))
            }
        }
        self.state = GraphState::Executed;

        let mut passes = std::mem::take(&mut self.passes);
        self.device.submit(&mut |rec| {
            let mut previous: Option<PassDependencies> = None;
            for pass in passes.drain(..) {
                let Pass {
                    name,
                    dependencies,
                    execute,
                } = pass;
                let _span = tracing::trace_span!("pass", name = %name).entered();

                if let Some(previous) = &previous {
                    let barrier = synthesize_barrier(&previous.exit, &dependencies.entry);
                    rec.pipeline_barrier(&barrier);
                    for image in &barrier.image_barriers {
                        image.texture.set_layout(image.new_layout);
                    }
                }

                execute(&mut *rec);
                previous = Some(dependencies);
            }
        })
    }

    /// Texture the graph renders into.
    pub fn target(&self) -> &Texture {
        &self.target
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Number of passes still to be executed.
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }
}

impl fmt::Debug for RenderGraph<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderGraph")
            .field("target", &self.target)
            .field(
                "passes",
                &self.passes.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            )
            .field("state", &self.state)
            .finish()
    }
}

/// Merge the exit state of one pass with the entry state of the next.
///
/// Textures left by `previous_exit` keep their layout unless `next_entry`
/// asks for another one. Textures only in `next_entry` transition from their
/// current layout with no source access. One entry per texture, in order of
/// first appearance.
pub fn synthesize_barrier(
    previous_exit: &[PassDependency],
    next_entry: &[PassDependency],
) -> PipelineBarrier {
    let mut src_stage = vk::PipelineStageFlags2::NONE;
    let mut dst_stage = vk::PipelineStageFlags2::NONE;
    let mut image_barriers: Vec<ImageBarrier> = Vec::new();
    let mut index: HashMap<vk::Image, usize> = HashMap::new();

    for dep in previous_exit {
        src_stage |= dep.stage;
        match index.get(&dep.texture.raw()) {
            Some(&i) => {
                let barrier = &mut image_barriers[i];
                barrier.src_access |= dep.access;
                barrier.old_layout = dep.layout;
                barrier.new_layout = dep.layout;
            }
            None => {
                index.insert(dep.texture.raw(), image_barriers.len());
                image_barriers.push(ImageBarrier {
                    texture: dep.texture.clone(),
                    old_layout: dep.layout,
                    new_layout: dep.layout,
                    src_access: dep.access,
                    dst_access: vk::AccessFlags2::NONE,
                });
            }
        }
    }

    for dep in next_entry {
        dst_stage |= dep.stage;
        match index.get(&dep.texture.raw()) {
            Some(&i) => {
                let barrier = &mut image_barriers[i];
                barrier.dst_access |= dep.access;
                barrier.new_layout = dep.layout;
            }
            None => {
                index.insert(dep.texture.raw(), image_barriers.len());
                image_barriers.push(ImageBarrier {
                    texture: dep.texture.clone(),
                    old_layout: dep.texture.current_layout(),
                    new_layout: dep.layout,
                    src_access: vk::AccessFlags2::NONE,
                    dst_access: dep.access,
                });
            }
        }
    }

    if src_stage.is_empty() {
        src_stage = vk::PipelineStageFlags2::TOP_OF_PIPE;
    }
    if dst_stage.is_empty() {
        dst_stage = vk::PipelineStageFlags2::BOTTOM_OF_PIPE;
    }

    PipelineBarrier {
        src_stage,
        dst_stage,
        image_barriers,
    }
}
