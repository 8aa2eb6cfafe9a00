use tch::nn::VarStore;
use tch::{Device, Kind};

pub trait ListTensors {
    /// Logs every variable of the store at debug level, prefixed with `group`.
    fn list_tensors(&self, group: &str);
    fn get_tensor_info(&self) -> Vec<TensorInfo>;
}

impl ListTensors for VarStore {
    fn list_tensors(&self, group: &str) {
        for info in self.get_tensor_info() {
            log::debug!(
                "[{}] {}: shape {:?}, {:?}, {:?}, requires grad {}",
                group,
                info.name,
                info.shape,
                info.device,
                info.kind,
                info.requires_grad
            );
        }
    }

    fn get_tensor_info(&self) -> Vec<TensorInfo> {
        let mut infos: Vec<TensorInfo> = self
            .variables()
            .into_iter()
            .map(|(name, tensor)| TensorInfo {
                name,
                shape: tensor.size(),
                device: tensor.device(),
                kind: tensor.kind(),
                requires_grad: tensor.requires_grad(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

#[derive(Debug)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<i64>,
    pub device: Device,
    pub kind: Kind,
    pub requires_grad: bool,
}
