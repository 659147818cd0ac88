//! WinRT BLE transport
//!
//! [`BleTransport`] on top of `Windows.Devices.Bluetooth`. Discovery always
//! uses uncached mode because GATT handles do not survive a reconnect.

use crate::domain::models::{DeviceAddress, GattEndpoint, GattService, PeripheralIdentity};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::transport::{BleTransport, TransportEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Radios::RadioState;
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

fn winrt_error(err: windows::core::Error) -> BleError {
    BleError::transport(err.to_string())
}

fn check(status: GattCommunicationStatus, what: &str) -> Result<(), BleError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(BleError::transport(format!("{} failed: {:?}", what, status)))
    }
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

struct WinLink {
    device: BluetoothLEDevice,
    // Keeps the OS from dropping the link while idle
    _session: Option<GattSession>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
}

pub struct WinRtTransport {
    events: broadcast::Sender<TransportEvent>,
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    link: Mutex<Option<WinLink>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            watcher: Mutex::new(None),
            link: Mutex::new(None),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<WinLink>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<BluetoothLEAdvertisementWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device(&self) -> Result<BluetoothLEDevice, BleError> {
        self.lock_link()
            .as_ref()
            .map(|link| link.device.clone())
            .ok_or(BleError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic, BleError> {
        self.lock_link()
            .as_ref()
            .ok_or(BleError::NotConnected)?
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| BleError::transport(format!("characteristic {} not discovered", uuid)))
    }

    async fn open_session(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }
}

impl Default for WinRtTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn radio_enabled(&self) -> bool {
        let radio = async {
            let adapter = BluetoothAdapter::GetDefaultAsync()?.await?;
            let radio = adapter.GetRadioAsync()?.await?;
            radio.State()
        };
        match radio.await {
            Ok(state) => state == RadioState::On,
            Err(e) => {
                warn!("Could not query Bluetooth radio: {}", e);
                false
            }
        }
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        let mut slot = self.lock_watcher();
        if let Some(old) = slot.take() {
            let _ = old.Stop();
        }

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(winrt_error)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(winrt_error)?;

        let sender = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let device = PeripheralIdentity {
                        address: DeviceAddress::new(args.BluetoothAddress()?),
                        name: (!name.is_empty()).then_some(name),
                        rssi: Some(args.RawSignalStrengthInDBm()?),
                    };
                    let _ = sender.send(TransportEvent::Discovered(device));
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(winrt_error)?;
        watcher.Start().map_err(winrt_error)?;
        *slot = Some(watcher);
        info!("Advertisement watcher started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.Stop().map_err(winrt_error)?;
            info!("Advertisement watcher stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralIdentity) -> Result<(), BleError> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(peripheral.address.as_u64())
            .map_err(winrt_error)?
            .await
            .map_err(winrt_error)?;
        info!("Device opened: {:?}", device.Name());

        let session = match Self::open_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let sender = self.events.clone();
        device
            .ConnectionStatusChanged(&TypedEventHandler::new(
                move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                    if let Some(dev) = dev.as_ref() {
                        if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                            let address = DeviceAddress::new(dev.BluetoothAddress()?);
                            let _ = sender.send(TransportEvent::LinkLost(address));
                        }
                    }
                    Ok(())
                },
            ))
            .map_err(winrt_error)?;

        *self.lock_link() = Some(WinLink {
            device,
            _session: session,
            characteristics: HashMap::new(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if let Some(link) = self.lock_link().take() {
            link.device.Close().map_err(winrt_error)?;
            info!("Device closed");
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        let device = self.device()?;
        let result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(winrt_error)?
            .await
            .map_err(winrt_error)?;
        check(result.Status().map_err(winrt_error)?, "GetGattServices")?;

        let services = result.Services().map_err(winrt_error)?;
        let mut discovered = Vec::new();
        let mut characteristics = HashMap::new();

        for i in 0..services.Size().map_err(winrt_error)? {
            let service = services.GetAt(i).map_err(winrt_error)?;
            let service_uuid = to_uuid(service.Uuid().map_err(winrt_error)?);

            let chars_result = service
                .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)
                .map_err(winrt_error)?
                .await
                .map_err(winrt_error)?;
            check(
                chars_result.Status().map_err(winrt_error)?,
                "GetCharacteristics",
            )?;

            let chars = chars_result.Characteristics().map_err(winrt_error)?;
            let mut uuids = Vec::new();
            for j in 0..chars.Size().map_err(winrt_error)? {
                let characteristic = chars.GetAt(j).map_err(winrt_error)?;
                let uuid = to_uuid(characteristic.Uuid().map_err(winrt_error)?);
                uuids.push(uuid);
                characteristics.insert(uuid, characteristic);
            }
            debug!("Service {}: {:?}", service_uuid, uuids);
            discovered.push(GattService {
                uuid: service_uuid,
                characteristics: uuids,
            });
        }

        match self.lock_link().as_mut() {
            Some(link) => link.characteristics = characteristics,
            None => return Err(BleError::NotConnected),
        }
        Ok(discovered)
    }

    async fn enable_notifications(&self, endpoint: &GattEndpoint) -> Result<(), BleError> {
        let characteristic = self.characteristic(endpoint.characteristic)?;

        let sender = self.events.clone();
        let uuid = endpoint.characteristic;
        characteristic
            .ValueChanged(&TypedEventHandler::new(
                move |_: windows::core::Ref<GattCharacteristic>,
                      args: windows::core::Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                        let mut value = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                        reader.ReadBytes(&mut value)?;
                        let _ = sender.send(TransportEvent::Notification {
                            characteristic: uuid,
                            value,
                        });
                    }
                    Ok(())
                },
            ))
            .map_err(winrt_error)?;

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(winrt_error)?
            .await
            .map_err(winrt_error)?;
        check(status, "Enable notifications")
    }

    async fn write(&self, endpoint: &GattEndpoint, data: &[u8]) -> Result<(), BleError> {
        let characteristic = self.characteristic(endpoint.characteristic)?;

        let writer = DataWriter::new().map_err(winrt_error)?;
        writer.WriteBytes(data).map_err(winrt_error)?;
        let buffer = writer.DetachBuffer().map_err(winrt_error)?;

        let status = characteristic
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)
            .map_err(winrt_error)?
            .await
            .map_err(winrt_error)?;
        check(status, "Write")
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
