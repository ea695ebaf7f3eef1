use eyre::{bail, ensure, OptionExt};

/// Label for the onboarding tunnel key derivation.
pub(crate) const KDF_LABEL: &[u8] = b"FIDO-KDF";

/// Fixed context prefix, followed by the suite dependent context random.
pub(crate) const KDF_CONTEXT: &[u8] = b"AutomaticOnboardTunnel";

/// KDF in Counter Mode
///
/// This code is ported from aws_lc and the NIST specification
///
/// https://nvlpubs.nist.gov/nistpubs/SpecialPublications/NIST.SP.800-108r1-upd1.pdf
pub(crate) fn kdf<const R: u8, const L_BYTES: u8>(
    alg: aws_lc_rs::hmac::Algorithm,
    // K_IN
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    // K_OUT
    output: &mut [u8],
) -> eyre::Result<()> {
    let k_in = aws_lc_rs::hmac::Key::new(alg, secret);

    let h_out_bytes = u64::try_from(alg.digest_algorithm().output_len())?;

    ensure!(h_out_bytes != 0);

    let l = output.len();

    // Convert to bits string
    let l_bits = l.checked_mul(8).ok_or_eyre("overflow")?.to_be_bytes();
    let l_be_idx = l_bits.len().saturating_sub(L_BYTES.into());
    let l_bits = &l_bits[l_be_idx..];
    // Exponent
    let r = u32::from(R);

    // NIST.SP.800-108r1-upd1: Step 1:
    // Determine how many output chunks are required to produce the requested
    // output length |out_len|. This determines how many times the variant compute
    // function will be called to output key material.
    let n: u64 = u64::try_from(l)?.div_ceil(h_out_bytes);

    // NIST.SP.800-108r1-upd1: Step 2:
    // Verify that the number of output chunks does not exceed R bits.
    if n > 2u64.pow(r).saturating_sub(1) {
        bail!("n too big");
    }

    let mut written = 0;
    for i in 1..=n {
        let i_bits = i.to_be_bytes();
        let i_be_idx = i_bits.len().saturating_sub(R.into());
        let i_bits = &i_bits[i_be_idx..];

        // NIST.SP.800-108r1-upd1: Step 4a:
        // K(i) := PRF(K_IN, [i]_2 || Label || 0x00 || Context || [L]_2)
        let mut prf_k_in = aws_lc_rs::hmac::Context::with_key(&k_in);
        prf_k_in.update(i_bits);
        prf_k_in.update(label);
        prf_k_in.update(&[0x00]);
        prf_k_in.update(context);
        prf_k_in.update(l_bits);
        let out_k_in = prf_k_in.sign();

        // NIST.SP.800-108r1-upd1: Step 4b, Step 5
        // result := result || K(i)
        // Ensure that we only copy |out_len| bytes in total from all chunks.
        let rem = l.saturating_sub(written);
        let take = rem.min(out_k_in.as_ref().len());
        output[written..written + take].copy_from_slice(&out_k_in.as_ref()[..take]);

        written += take;
    }

    Ok(())
}

/// Derives session key material for the onboarding tunnel.
///
/// `PRF(ShSe, [i] || "FIDO-KDF" || 0x00 || "AutomaticOnboardTunnel" || ContextRand || [L])`
pub(crate) fn derive_key_material(
    alg: aws_lc_rs::hmac::Algorithm,
    shared_secret: &[u8],
    context_rand: &[u8],
    output: &mut [u8],
) -> eyre::Result<()> {
    let mut context = Vec::with_capacity(KDF_CONTEXT.len() + context_rand.len());
    context.extend_from_slice(KDF_CONTEXT);
    context.extend_from_slice(context_rand);

    kdf::<1, 2>(alg, shared_secret, KDF_LABEL, &context, output)
}
