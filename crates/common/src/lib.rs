// freemonitor-common: wire protocol shared by the gateway, agents and dashboards

pub mod payload;
pub mod protocol;
