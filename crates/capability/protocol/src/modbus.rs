//! Modbus TCP / RTU 传输
//!
//! 一个 Context 对应一条链路；单元号可按请求覆盖。

use crate::error::TransportError;
use crate::serial::SerialSettings;
use crate::transport::{Timeouts, Transport};
use crate::types::{Reply, Request};
use async_trait::async_trait;
use domain::RegisterTable;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

/// 链路形态。
#[derive(Debug, Clone)]
pub enum ModbusLink {
    Tcp { host: String, port: u16 },
    Rtu(SerialSettings),
}

impl fmt::Display for ModbusLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Self::Rtu(serial) => write!(f, "{}@{}", serial.port, serial.baud),
        }
    }
}

/// Modbus 传输
pub struct ModbusTransport {
    link: ModbusLink,
    unit: u8,
    timeouts: Timeouts,
    ctx: Option<Context>,
}

/// 在请求超时内执行一次 Modbus 调用，并把三层结果压平。
async fn run<T, E, X, F>(timeouts: Timeouts, call: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<Result<T, X>, E>>,
    E: fmt::Display,
    X: fmt::Debug,
{
    tokio::time::timeout(timeouts.request, call)
        .await
        .map_err(|_| TransportError::Timeout("modbus request".to_string()))?
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(|e| TransportError::Protocol(format!("exception: {:?}", e)))
}

impl ModbusTransport {
    pub fn new(link: ModbusLink, unit: u8, timeouts: Timeouts) -> Self {
        Self {
            link,
            unit,
            timeouts,
            ctx: None,
        }
    }

    async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TransportError::Connect(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| TransportError::Connect(format!("{}:{} did not resolve", host, port)))
    }

    fn context(&mut self, unit: Option<u8>) -> Result<&mut Context, TransportError> {
        let unit = unit.unwrap_or(self.unit);
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotOpen)?;
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }

    async fn read(
        &mut self,
        table: RegisterTable,
        unit: Option<u8>,
        address: u16,
        count: u16,
    ) -> Result<Reply, TransportError> {
        let timeouts = self.timeouts;
        let ctx = self.context(unit)?;
        let reply = match table {
            RegisterTable::Holding => {
                Reply::Registers(run(timeouts, ctx.read_holding_registers(address, count)).await?)
            }
            RegisterTable::Input => {
                Reply::Registers(run(timeouts, ctx.read_input_registers(address, count)).await?)
            }
            RegisterTable::Coil => {
                let mut bits = run(timeouts, ctx.read_coils(address, count)).await?;
                bits.truncate(usize::from(count));
                Reply::Bits(bits)
            }
            RegisterTable::Discrete => {
                let mut bits = run(timeouts, ctx.read_discrete_inputs(address, count)).await?;
                bits.truncate(usize::from(count));
                Reply::Bits(bits)
            }
        };
        debug!(
            target: "devgw.protocol",
            link = %self.link,
            table = ?table,
            address,
            count,
            received = reply.len(),
            "modbus_read"
        );
        Ok(reply)
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    fn kind(&self) -> &'static str {
        match self.link {
            ModbusLink::Tcp { .. } => "modbus_tcp",
            ModbusLink::Rtu(_) => "modbus_rtu",
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let slave = Slave(self.unit);
        let ctx = match &self.link {
            ModbusLink::Tcp { host, port } => {
                let addr = Self::resolve(host, *port).await?;
                tokio::time::timeout(self.timeouts.connect, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| TransportError::Timeout(format!("connect {}", addr)))?
                    .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?
            }
            ModbusLink::Rtu(serial) => rtu::attach_slave(serial.open()?, slave),
        };
        info!(target: "devgw.protocol", link = %self.link, unit = self.unit, "modbus_connected");
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            info!(target: "devgw.protocol", link = %self.link, "modbus_closed");
        }
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        let timeouts = self.timeouts;
        match request {
            Request::ReadRegisters {
                table,
                unit,
                address,
                count,
            } => self.read(table, unit, address, count).await,
            Request::WriteRegisters {
                unit,
                address,
                values,
            } => {
                let ctx = self.context(unit)?;
                match values.as_slice() {
                    [] => {
                        return Err(TransportError::Protocol(
                            "write without registers".to_string(),
                        ))
                    }
                    [single] => run(timeouts, ctx.write_single_register(address, *single)).await?,
                    many => run(timeouts, ctx.write_multiple_registers(address, many)).await?,
                }
                Ok(Reply::Ack)
            }
            Request::WriteCoil {
                unit,
                address,
                value,
            } => {
                let ctx = self.context(unit)?;
                run(timeouts, ctx.write_single_coil(address, value)).await?;
                Ok(Reply::Ack)
            }
            other => Err(TransportError::Unsupported(format!(
                "modbus cannot {}",
                other.describe()
            ))),
        }
    }
}
