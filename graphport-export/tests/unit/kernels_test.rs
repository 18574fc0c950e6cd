use super::*;
use anyhow::Result;

fn f32s(shape: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_f32(shape.to_vec(), data.to_vec()).unwrap()
}

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch: {actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() <= tolerance, "{actual:?} differs from {expected:?}");
    }
}

#[test]
fn test_round_half_to_even() {
    assert_eq!(round_half_to_even(0.5), 0.0);
    assert_eq!(round_half_to_even(1.5), 2.0);
    assert_eq!(round_half_to_even(2.5), 2.0);
    assert_eq!(round_half_to_even(-0.5), 0.0);
    assert_eq!(round_half_to_even(-1.5), -2.0);
    assert_eq!(round_half_to_even(-2.5), -2.0);
    assert_eq!(round_half_to_even(2.4), 2.0);
    assert_eq!(round_half_to_even(-2.6), -3.0);
}

#[test]
fn test_binary_broadcasts() -> Result<()> {
    let a = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = f32s(&[3], &[10.0, 20.0, 30.0]);
    let sum = binary(BinaryOp::Add, &a, &b)?;
    assert_eq!(sum.shape(), &[2, 3]);
    assert_eq!(sum.as_f32()?, &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

    let column = f32s(&[2, 1], &[2.0, 4.0]);
    let quotient = binary(BinaryOp::Div, &a, &column)?;
    assert_eq!(quotient.as_f32()?, &[0.5, 1.0, 1.5, 1.0, 1.25, 1.5]);

    let scalar = Tensor::scalar_f32(2.0);
    assert_eq!(binary(BinaryOp::Pow, &b, &scalar)?.as_f32()?, &[100.0, 400.0, 900.0]);
    Ok(())
}

#[test]
fn test_binary_rejects_incompatible_operands() {
    let a = f32s(&[2, 3], &[0.0; 6]);
    let b = f32s(&[2], &[0.0; 2]);
    assert!(binary(BinaryOp::Add, &a, &b).is_err());

    let ints = Tensor::vector_i64(vec![1, 2, 3]);
    let floats = f32s(&[3], &[1.0, 2.0, 3.0]);
    assert!(binary(BinaryOp::Mul, &ints, &floats).is_err());
}

#[test]
fn test_integer_arithmetic() -> Result<()> {
    let positions = Tensor::vector_i64(vec![0, 1, 2]);
    let offset = Tensor::scalar_i64(2);
    assert_eq!(binary(BinaryOp::Add, &positions, &offset)?.as_i64()?, &[2, 3, 4]);
    assert!(binary(BinaryOp::Div, &positions, &Tensor::scalar_i64(0)).is_err());
    Ok(())
}

#[test]
fn test_matmul_plain_and_batched() -> Result<()> {
    let a = f32s(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
    let b = f32s(&[2, 3], &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0]);
    let product = matmul(&a, &b)?;
    assert_eq!(product.shape(), &[2, 3]);
    assert_eq!(product.as_f32()?, &[1.0, 2.0, 3.0, 3.0, 4.0, 7.0]);

    // Two batches of 1x2 times 2x1.
    let lhs = f32s(&[2, 1, 2], &[1.0, 2.0, 3.0, 4.0]);
    let rhs = f32s(&[2, 2, 1], &[1.0, 1.0, 2.0, 0.5]);
    let batched = matmul(&lhs, &rhs)?;
    assert_eq!(batched.shape(), &[2, 1, 1]);
    assert_eq!(batched.as_f32()?, &[3.0, 8.0]);

    assert!(matmul(&a, &f32s(&[3, 1], &[0.0; 3])).is_err());
    Ok(())
}

#[test]
fn test_matmul_integer_subtracts_zero_points() -> Result<()> {
    let a = Tensor::new(vec![1, 2], TensorData::U8(vec![130, 126]))?;
    let b = Tensor::from_i8(vec![2, 2], vec![1, -1, 2, 3])?;
    let a_zp = Tensor::new(Vec::new(), TensorData::U8(vec![128]))?;
    let b_zp = Tensor::from_i8(vec![2], vec![0, 1])?;

    let product = matmul_integer(&a, &b, &a_zp, &b_zp)?;
    assert_eq!(product.dtype(), DType::I32);
    // x = [2, -2]; column 0: 2*1 + -2*2 = -2; column 1: 2*(-2) + -2*2 = -8
    assert_eq!(product.as_i32()?, &[-2, -8]);
    Ok(())
}

#[test]
fn test_transpose() -> Result<()> {
    let t = f32s(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let transposed = transpose(&t, &[1, 0])?;
    assert_eq!(transposed.shape(), &[3, 2]);
    assert_eq!(transposed.as_f32()?, &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

    assert!(transpose(&t, &[0, 0]).is_err());
    assert!(transpose(&t, &[0]).is_err());
    Ok(())
}

#[test]
fn test_resolve_reshape() -> Result<()> {
    assert_eq!(resolve_reshape(&[2, 5, 8], &[0, 0, 4, 2])?, vec![2, 5, 4, 2]);
    assert_eq!(resolve_reshape(&[2, 5, 4, 2], &[0, 0, -1])?, vec![2, 5, 8]);
    assert_eq!(resolve_reshape(&[6], &[-1, 3])?, vec![2, 3]);
    assert!(resolve_reshape(&[6], &[-1, -1]).is_err());
    assert!(resolve_reshape(&[6], &[4, -1]).is_err());
    assert!(resolve_reshape(&[6], &[0, 0]).is_err());
    Ok(())
}

#[test]
fn test_gather_rows() -> Result<()> {
    let table = f32s(&[3, 2], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    let indices = Tensor::from_i64(vec![1, 2], vec![2, 0])?;
    let rows = gather(&table, &indices)?;
    assert_eq!(rows.shape(), &[1, 2, 2]);
    assert_eq!(rows.as_f32()?, &[2.0, 2.5, 0.0, 0.5]);

    let row = gather(&table, &Tensor::scalar_i64(-1))?;
    assert_eq!(row.shape(), &[2]);
    assert_eq!(row.as_f32()?, &[2.0, 2.5]);

    assert!(gather(&table, &Tensor::scalar_i64(3)).is_err());
    Ok(())
}

#[test]
fn test_unsqueeze_and_shape() -> Result<()> {
    let t = f32s(&[2, 3], &[0.0; 6]);
    assert_eq!(unsqueeze(&t, &[1, 2])?.shape(), &[2, 1, 1, 3]);
    assert_eq!(unsqueeze(&t, &[-1])?.shape(), &[2, 3, 1]);
    assert!(unsqueeze(&t, &[4]).is_err());

    assert_eq!(shape_of(&t).as_i64()?, &[2, 3]);
    Ok(())
}

#[test]
fn test_reductions_and_softmax() -> Result<()> {
    let t = f32s(&[2, 2], &[1.0, 3.0, 2.0, 2.0]);
    let mean = reduce_mean(&t, -1)?;
    assert_eq!(mean.shape(), &[2, 1]);
    assert_eq!(mean.as_f32()?, &[2.0, 2.0]);
    assert!(reduce_mean(&t, 0).is_err());

    let probabilities = softmax(&t, -1)?;
    let p = probabilities.as_f32()?;
    assert_close(&p[2..], &[0.5, 0.5], 1e-6);
    assert!((p[0] + p[1] - 1.0).abs() < 1e-6);
    assert!(p[1] > p[0]);
    Ok(())
}

#[test]
fn test_layer_norm() -> Result<()> {
    let x = f32s(&[1, 4], &[1.0, 2.0, 3.0, 4.0]);
    let gamma = f32s(&[4], &[1.0; 4]);
    let beta = f32s(&[4], &[0.5; 4]);
    let normalized = layer_norm(&x, &gamma, &beta, 0.0)?;

    let std = 1.25f32.sqrt();
    let expected: Vec<f32> = [-1.5f32, -0.5, 0.5, 1.5].iter().map(|v| v / std + 0.5).collect();
    assert_close(normalized.as_f32()?, &expected, 1e-5);

    assert!(layer_norm(&x, &f32s(&[3], &[1.0; 3]), &beta, 1e-12).is_err());
    Ok(())
}

#[test]
fn test_erf_matches_reference_values() {
    assert!(erf(0.0).abs() < 1e-6);
    assert!((erf(1.0) - 0.842_700_8).abs() < 1e-6);
    assert!((erf(-0.5) + 0.520_499_9).abs() < 1e-6);
    assert!((erf(3.0) - 0.999_977_9).abs() < 1e-6);
}

#[test]
fn test_cast_and_range() -> Result<()> {
    let mask = Tensor::from_i64(vec![1, 3], vec![1, 1, 0])?;
    let cast_mask = cast(&mask, DType::F32)?;
    assert_eq!(cast_mask.as_f32()?, &[1.0, 1.0, 0.0]);
    assert!(cast(&cast_mask, DType::I8).is_err());

    assert_eq!(range(0, 4, 1)?.as_i64()?, &[0, 1, 2, 3]);
    assert_eq!(range(2, 7, 2)?.as_i64()?, &[2, 4, 6]);
    assert!(range(0, 3, 0).is_err());
    assert!(range(3, 0, 1)?.as_i64()?.is_empty());
    Ok(())
}

#[test]
fn test_dequantize_linear_per_axis() -> Result<()> {
    let q = Tensor::from_i8(vec![2, 2], vec![127, -127, 64, 2])?;
    let scales = Tensor::vector_f32(vec![0.5, 0.25]);
    let zero_points = Tensor::from_i8(vec![2], vec![0, 0])?;

    let columns = dequantize_linear(&q, &scales, &zero_points, 1)?;
    assert_eq!(columns.as_f32()?, &[63.5, -31.75, 32.0, 0.5]);

    let rows = dequantize_linear(&q, &scales, &zero_points, 0)?;
    assert_eq!(rows.as_f32()?, &[63.5, -63.5, 16.0, 0.5]);

    assert!(dequantize_linear(&q, &Tensor::vector_f32(vec![1.0; 3]), &zero_points, 1).is_err());
    Ok(())
}

#[test]
fn test_dynamic_quantize_linear() -> Result<()> {
    let x = f32s(&[1, 3], &[-1.0, 0.0, 1.55]);
    let (y, scale, zero_point) = dynamic_quantize_linear(&x)?;

    let s = scale.as_f32()?[0];
    assert!((s - 0.01).abs() < 1e-6);
    assert_eq!(zero_point.as_u8()?, &[100]);
    assert_eq!(y.as_u8()?, &[0, 100, 255]);

    let (zeros, zero_scale, _) = dynamic_quantize_linear(&f32s(&[2], &[0.0, 0.0]))?;
    assert_eq!(zero_scale.as_f32()?, &[0.0]);
    assert_eq!(zeros.as_u8()?, &[0, 0]);
    Ok(())
}
