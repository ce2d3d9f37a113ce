//! Device discovery, buffers, tensors and activation

mod common;

use common::cpu_device;
use denoise_rt::dtype::DType;
use denoise_rt::prelude::*;
use denoise_rt::runtime::{PciAddress, parse_device_selector, select_from};
use denoise_rt::tensor::Access;

fn physical(device_type: DeviceType, score: u32, index: usize) -> PhysicalDevice {
    PhysicalDevice {
        device_type,
        score,
        name: format!("{device_type} {index}"),
        uuid: Some([index as u8; 16]),
        pci_address: Some(PciAddress {
            domain: 0,
            bus: index as u32,
            device: 0,
            function: 0,
        }),
        backend_index: index,
    }
}

#[test]
fn test_enumeration_is_ranked_and_includes_cpu() {
    let devices = enumerate_physical_devices();
    assert!(devices.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(devices.iter().any(|d| d.device_type == DeviceType::Cpu));
    assert_eq!(devices.last().map(|d| d.device_type), Some(DeviceType::Cpu));
}

#[test]
fn test_selection_by_criteria() {
    let devices = vec![
        physical(DeviceType::Cuda, 300, 0),
        physical(DeviceType::Wgpu, 200, 1),
        physical(DeviceType::Cpu, 100, 2),
    ];
    let pick = |s: DeviceSelector| select_from(&devices, &s).unwrap().backend_index;
    assert_eq!(pick(DeviceSelector::Type(DeviceType::Wgpu)), 1);
    assert_eq!(pick(DeviceSelector::Index(2)), 2);
    assert_eq!(pick(DeviceSelector::Uuid([1; 16])), 1);
    assert_eq!(pick(DeviceSelector::PciAddress("00:02.0".parse().unwrap())), 2);

    let err = select_from(&devices, &DeviceSelector::Index(3)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedHardware);
    let err = select_from(&devices[2..], &DeviceSelector::Type(DeviceType::Cuda)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedHardware);
}

#[test]
fn test_selector_strings() {
    assert_eq!(parse_device_selector("1"), Some(DeviceSelector::Index(1)));
    assert_eq!(
        parse_device_selector(" cpu "),
        Some(DeviceSelector::Type(DeviceType::Cpu))
    );
    assert_eq!(parse_device_selector(""), None);
    assert_eq!(parse_device_selector("tpu"), None);
}

#[test]
fn test_create_cpu_from_physical() {
    let physical = enumerate_physical_devices()
        .into_iter()
        .find(|d| d.device_type == DeviceType::Cpu)
        .unwrap();
    let device = create_device(&physical, DeviceConfig::default().with_num_threads(2)).unwrap();
    assert_eq!(device.device_type(), DeviceType::Cpu);
    assert_eq!(device.config().num_threads, Some(2));
    assert_eq!(device.caps().tensor_dtype, DType::F32);
    assert_eq!(device.engines().len(), 1);
}

#[test]
fn test_activation_is_scoped_and_not_reentrant() {
    let device = cpu_device();
    assert!(!device.is_active());
    {
        let guard = device.scoped_activate().unwrap();
        assert!(device.is_active());
        let err = device.scoped_activate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        drop(guard);
    }
    assert!(!device.is_active());
    let _again = device.scoped_activate().unwrap();
}

#[test]
fn test_activation_is_per_thread() {
    let device = cpu_device();
    let _guard = device.scoped_activate().unwrap();
    std::thread::scope(|s| {
        s.spawn(|| {
            assert!(!device.is_active());
            let inner = device.scoped_activate().unwrap();
            assert!(device.is_active());
            drop(inner);
            assert!(!device.is_active());
        });
    });
    assert!(device.is_active());
}

#[test]
fn test_buffer_read_write_and_bounds() {
    let device = cpu_device();
    let buffer = device.new_buffer(16).unwrap();
    assert!(buffer.is_owned());
    assert_eq!(buffer.storage(), Storage::Host);
    assert_eq!(buffer.device_id(), device.id());

    buffer.write(4, &[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 4];
    buffer.read(4, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);

    assert_eq!(
        buffer.write(14, &[0; 4]).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        device.new_buffer(0).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        device
            .new_buffer_with_storage(8, Storage::Undefined)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_buffer_memory_is_tracked() {
    let device = cpu_device();
    let before = device.allocated_bytes();
    let buffer = device.new_buffer(4096).unwrap();
    let view = buffer.clone();
    assert_eq!(device.allocated_bytes(), before + 4096);
    drop(buffer);
    assert_eq!(device.allocated_bytes(), before + 4096);
    drop(view);
    assert_eq!(device.allocated_bytes(), before);
}

#[test]
fn test_mapping_access_modes() {
    let device = cpu_device();
    let buffer = device.new_buffer(8).unwrap();
    {
        let mut map = buffer.map(Access::Write, 2, 4).unwrap();
        assert_eq!(map.len(), 4);
        map.as_mut_slice().unwrap().copy_from_slice(&[9, 8, 7, 6]);
        map.unmap().unwrap();
    }
    let map = buffer.map(Access::Read, 0, 0).unwrap();
    assert_eq!(map.len(), 8);
    assert_eq!(&map.as_slice()[2..6], &[9, 8, 7, 6]);
    drop(map);

    let mut read_only = buffer.map(Access::Read, 0, 4).unwrap();
    assert_eq!(
        read_only.as_mut_slice().unwrap_err().kind(),
        ErrorKind::InvalidOperation
    );
    assert!(buffer.map(Access::Read, 9, 0).is_err());
}

#[test]
fn test_shared_buffer_wraps_caller_memory() {
    let device = cpu_device();
    let mut memory = vec![0f32; 2 * 4 * 4];
    let before = device.allocated_bytes();
    let desc = TensorDesc::chw(2, 4, 4, DType::F32);
    // SAFETY: memory outlives the tensor and holds desc.byte_size() bytes.
    let tensor = unsafe { device.new_tensor_from_ptr(desc, memory.as_mut_ptr().cast()) }.unwrap();
    assert!(!tensor.buffer().is_owned());
    assert_eq!(device.allocated_bytes(), before);

    tensor.write_f32(&[1.5; 32]).unwrap();
    drop(tensor);
    assert!(memory.iter().all(|&v| v == 1.5));
}

#[test]
fn test_tensor_views_and_overlap() {
    let device = cpu_device();
    let desc = TensorDesc::chw(1, 4, 4, DType::F32);
    let buffer = device.new_buffer(desc.byte_size() * 2).unwrap();
    let a = device.new_tensor_in(&buffer, desc.clone(), 0).unwrap();
    let b = device.new_tensor_in(&buffer, desc.clone(), desc.byte_size()).unwrap();
    let c = device.new_tensor_in(&buffer, desc.clone(), 32).unwrap();
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&c) && b.overlaps(&c));

    let err = device
        .new_tensor_in(&buffer, desc.clone(), desc.byte_size() + 4)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let other = cpu_device();
    let err = other.new_tensor_in(&buffer, desc, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_image_regions_and_overlap() {
    let device = cpu_device();
    let image = Image::alloc(device.as_ref(), Format::Float4, 4, 3).unwrap();
    image
        .write_pixels(0, 0, 4, 3, 4, &vec![0.25; 4 * 3 * 4])
        .unwrap();
    image.write_pixels(1, 1, 2, 1, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let row = image.read_pixels(0, 1, 4, 1).unwrap();
    assert_eq!(
        row,
        vec![
            0.25, 0.25, 0.25, 0.25, 1.0, 2.0, 3.0, 0.25, 4.0, 5.0, 6.0, 0.25, 0.25, 0.25, 0.25,
            0.25
        ]
    );
    assert!(image.read_pixels(3, 0, 2, 1).is_err());

    let top = Image::new(image.buffer().clone(), Format::Float4, 4, 1, 0, 0, 0).unwrap();
    let bottom = Image::new(image.buffer().clone(), Format::Float4, 4, 1, 2 * 64, 0, 0).unwrap();
    assert!(top.overlaps(&image));
    assert!(!top.overlaps(&bottom));

    let half = Image::alloc(device.as_ref(), Format::Half3, 4, 3).unwrap();
    half.copy_from(&image, 1).unwrap();
    assert_eq!(half.read_pixels(1, 1, 1, 1).unwrap(), vec![1.0, 2.0, 3.0]);
}
