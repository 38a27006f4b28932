/*!
 # Device session

 Owns the one Bluetooth link to one lamp. Every operation follows the same
 two steps: make sure a link is up (connecting if needed), then attempt the
 I/O once. A failed read or write drops the link, so the next operation
 starts with a fresh connect.
*/

use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::characteristics::{decode_string, CharacteristicMap, LampIdentity, LogicalHandle};
use crate::config::CONNECT_TIMEOUT;
use crate::state::{EffectFrame, LampState, Rgbw, BATTERY_UNKNOWN};
use crate::transport::{Link, Transport};
use crate::{Error, Result};

/// Pause between two connect attempts
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// The message of a link error without the prefix its `Display` adds.
fn detail(err: Error) -> String {
    match err {
        Error::Connection(msg) | Error::Write(msg) | Error::Read(msg) => msg,
        e => e.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What one successful connect attempt produced
struct Discovery {
    link: Box<dyn Link>,
    handles: CharacteristicMap,
    name: Option<String>,
    manufacturer: Option<String>,
    serial: Option<String>,
}

/// A logical connection to one PlayBulb
pub struct DeviceSession<T> {
    transport: T,
    identity: LampIdentity,
    handles: CharacteristicMap,
    link: Option<Box<dyn Link>>,
    connection: ConnectionState,
    state: LampState,
    /// Budget for implicit reconnects and single BLE calls
    timeout: Duration,
    strict: bool,
    /// Set when strict checking refused the device
    blocked: bool,
    ever_connected: bool,
    reconnected: bool,
    last_error: Option<String>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T, interface: u8, address: impl Into<String>) -> Self {
        DeviceSession {
            transport,
            identity: LampIdentity::new(interface, address),
            handles: CharacteristicMap::default(),
            link: None,
            connection: ConnectionState::Disconnected,
            state: LampState::default(),
            timeout: CONNECT_TIMEOUT,
            strict: false,
            blocked: false,
            ever_connected: false,
            reconnected: false,
            last_error: None,
        }
    }

    pub fn identity(&self) -> &LampIdentity {
        &self.identity
    }

    pub fn handles(&self) -> &CharacteristicMap {
        &self.handles
    }

    pub fn state(&self) -> &LampState {
        &self.state
    }

    /// Seeds the believed lamp state before the first connect.
    pub fn seed_state(&mut self, state: LampState) {
        self.state = state;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// When strict, an unsupported device is refused instead of warned about.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Returns and clears the flag set by a connect that followed an earlier
    /// connection.
    pub fn take_reconnected(&mut self) -> bool {
        std::mem::take(&mut self.reconnected)
    }

    /// Connects, retrying until `timeout` runs out.
    #[instrument(skip(self), fields(address = %self.identity.address))]
    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        self.last_error = None;
        self.drop_link().await;
        self.connection = ConnectionState::Connecting;

        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;
        let mut failure = None;
        while Instant::now() < deadline {
            attempt += 1;
            trace!("Connect attempt {}", attempt);

            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = match time::timeout(remaining, self.discover(remaining)).await {
                Ok(Ok(found)) => return self.establish(found).await,
                Ok(Err(e)) => detail(e),
                Err(_) => format!("no answer within {:?}", timeout),
            };

            error!("Connection failed: {} (attempt {})", msg, attempt);
            failure = Some(msg);
            time::sleep(RETRY_BACKOFF).await;
        }

        self.connection = ConnectionState::Disconnected;
        let err = Error::Connection(failure.unwrap_or_else(|| "timed out".to_string()));
        self.last_error = Some(err.to_string());
        Err(err)
    }

    /// Opens a link and resolves the characteristics. The link is closed again
    /// if the lamp doesn't expose what we need.
    async fn discover(&self, budget: Duration) -> Result<Discovery> {
        let link = self
            .transport
            .open(self.identity.interface, &self.identity.address, budget)
            .await?;

        match Self::enumerate(link.as_ref()).await {
            Ok((handles, name, manufacturer, serial)) => Ok(Discovery {
                link,
                handles,
                name,
                manufacturer,
                serial,
            }),
            Err(e) => {
                let _ = link.disconnect().await;
                Err(e)
            }
        }
    }

    async fn enumerate(
        link: &dyn Link,
    ) -> Result<(CharacteristicMap, Option<String>, Option<String>, Option<String>)> {
        let handles = CharacteristicMap::resolve(&link.characteristics().await?);
        for required in [LogicalHandle::Color, LogicalHandle::Effects] {
            if handles.get(required).is_none() {
                return Err(Error::CharacteristicNotFound(required.name()));
            }
        }

        let mut strings = [None, None, None];
        for (slot, logical) in strings.iter_mut().zip([
            LogicalHandle::Name,
            LogicalHandle::Manufacturer,
            LogicalHandle::Serial,
        ]) {
            if let Some(handle) = handles.get(logical) {
                *slot = Some(decode_string(&link.read(handle).await?));
            }
        }
        let [name, manufacturer, serial] = strings;
        Ok((handles, name, manufacturer, serial))
    }

    async fn establish(&mut self, found: Discovery) -> Result<()> {
        self.identity.name = found.name;
        self.identity.manufacturer = found.manufacturer;
        self.identity.serial = found.serial;

        if !self.identity.is_supported() {
            let err = self.mismatch();
            if self.strict {
                error!("Device found is not supported, refusing it: {}", err);
                let _ = found.link.disconnect().await;
                self.blocked = true;
                self.connection = ConnectionState::Disconnected;
                self.last_error = Some(err.to_string());
                return Err(err);
            }
            warn!("Device found is not supported, trying anyway: {}", err);
        } else {
            info!(
                "Connected to device: Name = '{}', Manufacturer = '{}', Serial = '{}'",
                self.identity.name.as_deref().unwrap_or("?"),
                self.identity.manufacturer.as_deref().unwrap_or("?"),
                self.identity.serial.as_deref().unwrap_or("?"),
            );
        }

        self.blocked = false;
        self.link = Some(found.link);
        self.handles = found.handles;
        self.connection = ConnectionState::Connected;
        if self.ever_connected {
            debug!("Lamp reconnected");
            self.reconnected = true;
        }
        self.ever_connected = true;

        match self.fetch_state().await {
            Ok(state) => self.state = state,
            Err(e) => warn!("Initial state read failed: {}", e),
        }
        Ok(())
    }

    fn mismatch(&self) -> Error {
        Error::ProtocolMismatch {
            manufacturer: self.identity.manufacturer.clone().unwrap_or_default(),
            serial: self.identity.serial.clone().unwrap_or_default(),
        }
    }

    /// Releases the link. Safe to call when already disconnected.
    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) {
        debug!(
            "Disconnecting device '{}'",
            self.identity.name.as_deref().unwrap_or(&self.identity.address)
        );
        self.drop_link().await;
    }

    async fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.disconnect().await {
                warn!("Error while disconnecting: {}", e);
            }
        }
        self.handles.clear();
        self.connection = ConnectionState::Disconnected;
    }

    /// Forgets a link that just failed, without talking to it.
    fn link_lost(&mut self, err: &Error) {
        error!("{}", err);
        self.last_error = Some(err.to_string());
        self.link = None;
        self.handles.clear();
        self.connection = ConnectionState::Disconnected;
    }

    /// Step one of every operation.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.blocked {
            let err = self.mismatch();
            self.last_error = Some(err.to_string());
            return Err(err);
        }
        if self.is_connected() {
            return Ok(());
        }
        debug!("Not connected, connecting first");
        self.connect(self.timeout).await
    }

    fn handle(&self, logical: LogicalHandle) -> Result<(&dyn Link, u16)> {
        let link = self
            .link
            .as_deref()
            .ok_or_else(|| Error::Connection("not connected".into()))?;
        let handle = self
            .handles
            .get(logical)
            .ok_or(Error::CharacteristicNotFound(logical.name()))?;
        Ok((link, handle))
    }

    async fn write(&mut self, logical: LogicalHandle, data: &[u8]) -> Result<()> {
        self.last_error = None;
        self.ensure_connected().await?;

        let (link, handle) = self.handle(logical)?;
        trace!("Writing {:02x?} to handle {:#06x}", data, handle);
        let result = match time::timeout(self.timeout, link.write(handle, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Write(format!("packet send error: {}", detail(e)))),
            Err(_) => Err(Error::Write(format!(
                "packet send error: no answer within {:?}",
                self.timeout
            ))),
        };

        if let Err(e) = &result {
            self.link_lost(e);
        }
        result
    }

    /// Writes white, red, green, blue to the color characteristic.
    #[instrument(skip(self))]
    pub async fn write_color(&mut self, color: Rgbw) -> Result<()> {
        self.write(LogicalHandle::Color, &color.to_bytes()).await?;
        self.state.color = color;
        self.state.power = !color.is_off();
        Ok(())
    }

    /// Writes a full color, effect and speed frame.
    #[instrument(skip(self))]
    pub async fn write_effect(&mut self, frame: EffectFrame) -> Result<()> {
        self.write(LogicalHandle::Effects, &frame.to_bytes()).await?;
        self.state.color = frame.color;
        self.state.effect = frame.effect;
        self.state.speed = frame.speed;
        Ok(())
    }

    /// Reads color, effect, speed and battery. Nothing is committed unless
    /// every read succeeds.
    #[instrument(skip(self))]
    pub async fn read_state(&mut self) -> Result<LampState> {
        self.last_error = None;
        self.ensure_connected().await?;

        match self.fetch_state().await {
            Ok(state) => {
                debug!("Read lamp state: {:?}", state);
                self.state = state;
                Ok(state)
            }
            Err(e) => {
                let err = Error::Read(format!("status read error: {}", detail(e)));
                self.link_lost(&err);
                Err(err)
            }
        }
    }

    async fn read(&self, logical: LogicalHandle) -> Result<Vec<u8>> {
        let (link, handle) = self.handle(logical)?;
        match time::timeout(self.timeout, link.read(handle)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Read(format!(
                "{} gave no answer within {:?}",
                logical.name(),
                self.timeout
            ))),
        }
    }

    async fn fetch_state(&self) -> Result<LampState> {
        let color = self.read(LogicalHandle::Color).await?;
        let color: [u8; 4] = color
            .get(..4)
            .and_then(|c| c.try_into().ok())
            .ok_or_else(|| Error::Read(format!("short color frame {:02x?}", color)))?;

        // This characteristic also carries the live, effect-animated color.
        // Only effect and speed are taken from it.
        let effects = self.read(LogicalHandle::Effects).await?;
        if effects.len() < 7 {
            return Err(Error::Read(format!("short effects frame {:02x?}", effects)));
        }

        let battery = match self.handles.get(LogicalHandle::Battery) {
            Some(_) => {
                let raw = self.read(LogicalHandle::Battery).await?;
                raw.iter()
                    .fold(0u32, |acc, b| (acc << 8) | *b as u32)
                    .min(BATTERY_UNKNOWN as u32) as u8
            }
            None => BATTERY_UNKNOWN,
        };

        let color = Rgbw::from_bytes(color);
        Ok(LampState {
            power: !color.is_off(),
            color,
            effect: effects[4],
            speed: effects[6],
            battery,
        })
    }
}
