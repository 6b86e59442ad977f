// Minimal controller and element stand-ins for the unit tests of this crate.
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::controller::{Axis, Controller, CtrlResult, ElementType};
use crate::element::{AcqValue, Acquirable, Propagate, State, StateInfo};

pub struct DummyCtrl {
    name: String,
    types: Vec<ElementType>,
    software: bool,
}
impl DummyCtrl {
    pub fn shared(name: &str, types: &[ElementType]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            types: types.to_vec(),
            software: false,
        })
    }

    pub fn software(name: &str, types: &[ElementType]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            types: types.to_vec(),
            software: true,
        })
    }
}
impl Controller for DummyCtrl {
    fn name(&self) -> &str {
        &self.name
    }
    fn ctrl_types(&self) -> &[ElementType] {
        &self.types
    }
    fn is_software(&self) -> bool {
        self.software
    }
    fn state_one(&self, _axis: Axis) -> CtrlResult<StateInfo> {
        Ok(State::On.into())
    }
    fn read_one(&self, _axis: Axis) -> CtrlResult<AcqValue> {
        Ok(AcqValue::scalar(0.))
    }
}

pub struct TestElement {
    name: String,
    ctrl_name: String,
    axis: Axis,
    lock: ReentrantMutex<()>,
    pub state: Mutex<Option<StateInfo>>,
}
impl Acquirable for TestElement {
    fn name(&self) -> &str {
        &self.name
    }
    fn axis(&self) -> Axis {
        self.axis
    }
    fn ctrl_name(&self) -> &str {
        &self.ctrl_name
    }
    fn operation_lock(&self) -> &ReentrantMutex<()> {
        &self.lock
    }
    fn put_value(&self, _value: AcqValue, _index: Option<u64>, _propagate: Propagate) {}
    fn set_state(&self, state: State, _propagate: Propagate) {
        *self.state.lock() = Some(state.into());
    }
    fn set_state_info(&self, info: StateInfo, _propagate: Propagate) {
        *self.state.lock() = Some(info);
    }
    fn clear_operation(&self) {}
    fn propagate_value(&self, _priority: u8) {}
}

pub fn element(name: &str, ctrl_name: &str, axis: Axis) -> Arc<dyn Acquirable> {
    Arc::new(TestElement {
        name: name.to_string(),
        ctrl_name: ctrl_name.to_string(),
        axis,
        lock: ReentrantMutex::new(()),
        state: Mutex::new(None),
    })
}
