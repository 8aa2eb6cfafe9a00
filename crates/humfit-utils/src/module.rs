use tch::{Device, Tensor};

/// A trait for collections of tensors that can be moved between devices and converted to/from vectors.
pub trait TensorCollection: Send {
    /// Moves all tensors in the collection to the specified device.
    fn to_device(&self, device: Device) -> Self;

    /// Converts the collection to a vector of tensors.
    fn as_tensor_vec(&self) -> Vec<Tensor>;

    /// Creates a new collection from a vector of tensors.
    fn from_vec(tensors: Vec<Tensor>) -> Self;
}

impl TensorCollection for Tensor {
    fn to_device(&self, device: Device) -> Self {
        self.to_device(device)
    }

    fn as_tensor_vec(&self) -> Vec<Tensor> {
        vec![self.shallow_clone()]
    }

    fn from_vec(tensors: Vec<Tensor>) -> Self {
        assert_eq!(tensors.len(), 1, "Expected one tensor");
        tensors[0].shallow_clone()
    }
}

impl TensorCollection for (Tensor, Tensor) {
    fn to_device(&self, device: Device) -> Self {
        (self.0.to_device(device), self.1.to_device(device))
    }

    fn as_tensor_vec(&self) -> Vec<Tensor> {
        vec![self.0.shallow_clone(), self.1.shallow_clone()]
    }

    fn from_vec(tensors: Vec<Tensor>) -> Self {
        assert_eq!(tensors.len(), 2, "Expected two tensors");
        (tensors[0].shallow_clone(), tensors[1].shallow_clone())
    }
}

/// `ModuleMT` is a `tch-rs` `ModuleT` with support for `n` sized input / output tensors
pub trait ModuleMT<Input, Output>: Send
where
    Input: TensorCollection,
    Output: TensorCollection,
{
    /// Performs a forward pass through the module.
    ///
    /// # Arguments
    ///
    /// * `xs` - The input tensor collection.
    /// * `train` - Whether the module is in training mode.
    ///
    /// # Returns
    ///
    /// The output tensor collection.
    fn forward_mt(&self, xs: Input, train: bool) -> Output;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Kind};

    struct TestModule {
        fc: nn::Linear,
    }

    impl TestModule {
        fn new(p: &nn::Path, in_dim: i64, out_dim: i64) -> Self {
            let fc = nn::linear(p, in_dim, out_dim, Default::default());
            Self { fc }
        }
    }

    impl ModuleMT<Tensor, Tensor> for TestModule {
        fn forward_mt(&self, xs: Tensor, _train: bool) -> Tensor {
            xs.apply(&self.fc)
        }
    }

    impl ModuleMT<(Tensor, Tensor), (Tensor, Tensor)> for TestModule {
        fn forward_mt(&self, xs: (Tensor, Tensor), _train: bool) -> (Tensor, Tensor) {
            (xs.0.apply(&self.fc), xs.1.apply(&self.fc))
        }
    }

    #[test]
    fn test_single_tensor_forward() {
        let device = Device::Cpu;
        let vs = nn::VarStore::new(device);
        let module = TestModule::new(&vs.root(), 10, 5);
        let xs = Tensor::randn(&[4, 10], (Kind::Float, device));

        let ys: Tensor = module.forward_mt(xs, false);
        assert_eq!(ys.size(), &[4, 5]);
    }

    #[test]
    fn test_tuple_forward_matches_single() {
        let device = Device::Cpu;
        let vs = nn::VarStore::new(device);
        let module = TestModule::new(&vs.root(), 10, 5);
        let xs_0 = Tensor::randn(&[4, 10], (Kind::Float, device));
        let xs_1 = Tensor::randn(&[4, 10], (Kind::Float, device));

        let (ys_0, ys_1): (Tensor, Tensor) =
            module.forward_mt((xs_0.shallow_clone(), xs_1.shallow_clone()), false);
        let single: Tensor = module.forward_mt(xs_1, false);

        assert_eq!(ys_0.size(), &[4, 5]);
        assert!(ys_1.allclose(&single, 1e-5, 1e-8, false));
    }

    #[test]
    fn test_collection_round_trip() {
        let pair = (Tensor::ones(&[2], tch::kind::FLOAT_CPU), Tensor::zeros(&[3], tch::kind::FLOAT_CPU));
        let rebuilt = <(Tensor, Tensor)>::from_vec(pair.as_tensor_vec());
        assert_eq!(rebuilt.0.size(), &[2]);
        assert_eq!(rebuilt.1.size(), &[3]);
        assert_eq!(TensorCollection::to_device(&rebuilt, Device::Cpu).0.device(), Device::Cpu);
    }
}
