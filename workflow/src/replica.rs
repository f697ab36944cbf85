use std::{
    iter,
    ops::{Deref, DerefMut},
};

use launcher::{DeviceAssignment, ProcessGroup, WorkerContext};
use log::debug;

use crate::{
    error::{Result, WorkflowError},
    model::Model,
};

/// How a model is replicated across the group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaOptions {
    /// Reduce gradients as half precision floats.
    pub gradient_compression: bool,
    /// The devices the replica lives on, `None` for cpu.
    pub device_ids: Option<Vec<usize>>,
    /// Broadcast the leader's buffers before every forward pass.
    pub broadcast_buffers: bool,
    /// Reduce zeros for parameters that got no gradient instead of failing.
    pub find_unused_parameters: bool,
}

/// A model replicated on every member of the group whose gradients are averaged across
/// all replicas.
///
/// Every member must call `synchronize` the same number of times, a member that skips
/// one leaves the rest of the group blocked in the collective.
pub struct DistributedModel<M> {
    module: M,
    ctx: WorkerContext,
    group: ProcessGroup,
    options: ReplicaOptions,
    flat: Vec<f32>,
}

impl<M: Model> DistributedModel<M> {
    /// Wraps `module`, replacing its parameters and buffers with the leader's so every
    /// replica starts identical.
    ///
    /// # Arguments
    /// * `module` - The local replica.
    /// * `ctx` - The identity of this worker.
    /// * `group` - The group gradients are averaged over.
    /// * `options` - The replication options.
    ///
    /// # Returns
    /// The wrapped model or an error if the devices don't match the worker's assignment
    /// or the initial broadcast fails.
    pub async fn wrap(
        module: M,
        ctx: WorkerContext,
        group: ProcessGroup,
        options: ReplicaOptions,
    ) -> Result<Self> {
        match (&options.device_ids, ctx.device()) {
            (None, _) => {}
            (Some(ids), DeviceAssignment::Accelerator(ordinal)) if ids[..] == [ordinal] => {}
            (Some(ids), device) => {
                return Err(WorkflowError::Config(format!(
                    "replica devices {ids:?} don't match the worker's device {device:?}"
                )));
            }
        }

        let mut replica = Self {
            module,
            ctx,
            group,
            options,
            flat: Vec::new(),
        };

        replica.broadcast_parameters().await?;
        replica.broadcast_buffers().await?;

        debug!(rank = replica.ctx.global_rank(); "replica ready on {:?}", replica.ctx.device());
        Ok(replica)
    }

    pub fn ctx(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn options(&self) -> &ReplicaOptions {
        &self.options
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn into_inner(self) -> M {
        self.module
    }

    /// Overwrites every replica's parameters with the leader's.
    pub async fn broadcast_parameters(&mut self) -> Result<()> {
        let Self {
            module,
            group,
            flat,
            ..
        } = self;

        flat.clear();
        module
            .parameters()
            .iter()
            .for_each(|p| flat.extend_from_slice(&p.value));

        group.broadcast(flat).await?;

        let mut offset = 0;
        for p in module.parameters_mut() {
            let n = p.value.len();
            p.value.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }

        Ok(())
    }

    async fn broadcast_buffers(&mut self) -> Result<()> {
        let Self {
            module,
            group,
            flat,
            ..
        } = self;

        if module.buffers().is_empty() {
            return Ok(());
        }

        flat.clear();
        module
            .buffers()
            .iter()
            .for_each(|b| flat.extend_from_slice(&b.value));

        group.broadcast(flat).await?;

        let mut offset = 0;
        for b in module.buffers_mut() {
            let n = b.value.len();
            b.value.copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }

        Ok(())
    }

    /// Must be called before every forward pass, syncs buffers when enabled.
    pub async fn before_forward(&mut self) -> Result<()> {
        if self.options.broadcast_buffers {
            self.broadcast_buffers().await?;
        }

        Ok(())
    }

    /// Averages every parameter's gradient across the group, must follow every backward
    /// pass.
    pub async fn synchronize(&mut self) -> Result<()> {
        let Self {
            module,
            group,
            options,
            flat,
            ..
        } = self;

        flat.clear();
        for p in module.parameters() {
            match &p.grad {
                Some(grad) if grad.len() == p.value.len() => flat.extend_from_slice(grad),
                Some(grad) => {
                    return Err(WorkflowError::GradientLength {
                        name: p.name.clone(),
                        got: grad.len(),
                        expected: p.value.len(),
                    });
                }
                None if options.find_unused_parameters => {
                    flat.extend(iter::repeat_n(0.0, p.value.len()));
                }
                None => {
                    return Err(WorkflowError::UnusedParameter {
                        name: p.name.clone(),
                    });
                }
            }
        }

        group
            .all_reduce_mean(flat, options.gradient_compression)
            .await?;

        let mut offset = 0;
        for p in module.parameters_mut() {
            let reduced = &flat[offset..offset + p.value.len()];
            offset += reduced.len();

            match &mut p.grad {
                Some(grad) => grad.copy_from_slice(reduced),
                None => p.grad = Some(reduced.to_vec()),
            }
        }

        Ok(())
    }
}

impl<M> Deref for DistributedModel<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.module
    }
}

impl<M> DerefMut for DistributedModel<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.module
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use half::f16;
    use launcher::{DeviceKind, Topology};

    use super::*;
    use crate::model::Parameter;

    struct Pair(Vec<Parameter>);

    impl fmt::Display for Pair {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Pair")
        }
    }

    impl Model for Pair {
        fn parameters(&self) -> &[Parameter] {
            &self.0
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.0
        }

        fn set_training(&mut self, _: bool) {}

        fn is_training(&self) -> bool {
            true
        }
    }

    fn pair() -> Pair {
        Pair(vec![
            Parameter::new("weight", vec![1.0, 2.0]),
            Parameter::new("bias", vec![0.0]),
        ])
    }

    fn solo_ctx() -> WorkerContext {
        Topology::new(1, 1, 0).unwrap().context(0, DeviceKind::Cpu).unwrap()
    }

    #[tokio::test]
    async fn unused_parameters_fail_unless_allowed() {
        let mut model = pair();
        model.0[0].grad = Some(vec![0.5, 0.5]);

        let mut replica =
            DistributedModel::wrap(model, solo_ctx(), ProcessGroup::solo(), ReplicaOptions::default())
                .await
                .unwrap();

        let err = replica.synchronize().await.unwrap_err();
        assert!(matches!(err, WorkflowError::UnusedParameter { ref name } if name == "bias"));

        let options = ReplicaOptions {
            find_unused_parameters: true,
            ..ReplicaOptions::default()
        };
        let mut replica = DistributedModel::wrap(replica.into_inner(), solo_ctx(), ProcessGroup::solo(), options)
            .await
            .unwrap();

        replica.synchronize().await.unwrap();
        assert_eq!(replica.parameters()[0].grad, Some(vec![0.5, 0.5]));
        assert_eq!(replica.parameters()[1].grad, Some(vec![0.0]));
    }

    #[tokio::test]
    async fn compressed_gradients_are_rounded() {
        let mut model = pair();
        model.0[0].grad = Some(vec![0.1, 1.0 / 3.0]);
        model.0[1].grad = Some(vec![2.0]);

        let options = ReplicaOptions {
            gradient_compression: true,
            ..ReplicaOptions::default()
        };
        let mut replica = DistributedModel::wrap(model, solo_ctx(), ProcessGroup::solo(), options)
            .await
            .unwrap();

        replica.synchronize().await.unwrap();

        let expected: Vec<f32> = [0.1f32, 1.0 / 3.0].iter().map(|x| f16::from_f32(*x).to_f32()).collect();
        assert_eq!(replica.parameters()[0].grad, Some(expected));
        assert_eq!(replica.parameters()[1].grad, Some(vec![2.0]));
    }

    #[tokio::test]
    async fn malformed_gradients_are_rejected() {
        let mut model = pair();
        model.0[0].grad = Some(vec![1.0]);
        model.0[1].grad = Some(vec![1.0]);

        let mut replica =
            DistributedModel::wrap(model, solo_ctx(), ProcessGroup::solo(), ReplicaOptions::default())
                .await
                .unwrap();

        let err = replica.synchronize().await.unwrap_err();
        assert!(matches!(err, WorkflowError::GradientLength { got: 1, expected: 2, .. }));
    }

    #[tokio::test]
    async fn cpu_workers_reject_device_ids() {
        let options = ReplicaOptions {
            device_ids: Some(vec![0]),
            ..ReplicaOptions::default()
        };

        let outcome = DistributedModel::wrap(pair(), solo_ctx(), ProcessGroup::solo(), options).await;
        assert!(matches!(outcome, Err(WorkflowError::Config(_))));
    }
}
